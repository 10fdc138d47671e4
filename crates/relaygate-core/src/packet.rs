//! Packet model: the unit exchanged between clients, agents and the gateway
//!
//! A packet carries an opaque `payload` plus a string-keyed `spec` map for
//! out-of-band metadata (session id, access durations, serialized sub-objects).
//! The `packet_type` vocabulary is shared by every component; its meaning
//! depends on which component sent it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::encoding::{base64_bytes, base64_map};

/// Which side of the gateway produced a packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Agent,
    #[default]
    Gateway,
    Client,
}

/// A single framed message on a packet stream.
///
/// On the wire a packet is one JSON object; `payload` and `spec` values are
/// base64 so binary data survives unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default)]
    pub component: Component,
    #[serde(rename = "type")]
    pub packet_type: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    #[serde(default, with = "base64_map", skip_serializing_if = "HashMap::is_empty")]
    pub spec: HashMap<String, Vec<u8>>,
}

/// Errors produced while encoding or decoding a packet body
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("invalid packet body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("packet without a type")]
    MissingType,
}

// ── Well-known packet types ──

/// Packet type vocabulary
pub mod types {
    pub const GATEWAY_CONNECT: &str = "Gateway::Connect";
    pub const GATEWAY_CONNECT_OK: &str = "Gateway::ConnectOK";
    pub const GATEWAY_CONNECT_ERR: &str = "Gateway::ConnectErr";
    pub const KEEP_ALIVE: &str = "KeepAlive";

    pub const SESSION_OPEN: &str = "Session::Open";
    pub const SESSION_OPEN_OK: &str = "Session::OpenOK";
    pub const SESSION_OPEN_WAITING_APPROVAL: &str = "Session::OpenWaitingApproval";
    pub const SESSION_OPEN_APPROVE_OK: &str = "Session::OpenApproveOK";
    pub const SESSION_OPEN_AGENT_OFFLINE: &str = "Session::OpenAgentOffline";
    pub const SESSION_OPEN_TIMEOUT: &str = "Session::OpenTimeout";
    pub const SESSION_CLOSE: &str = "Session::Close";

    pub const WRITE_STDIN: &str = "Terminal::WriteStdin";
    pub const WRITE_STDOUT: &str = "Terminal::WriteStdout";
    pub const WRITE_STDERR: &str = "Terminal::WriteStderr";

    pub const PROXY_MANAGER_CONNECT_OK: &str = "ProxyManager::ConnectOK";
    pub const PROXY_MANAGER_CONNECT_OK_ACK: &str = "ProxyManager::ConnectOKAck";
}

/// Spec map keys
pub mod spec {
    pub const SESSION_ID: &str = "gateway.session_id";
    pub const CONNECTION_TYPE: &str = "gateway.connection_type";
    pub const CONNECTION_NAME: &str = "gateway.connection_name";
    pub const ERROR_CODE: &str = "gateway.error_code";
    pub const JIT_TIMEOUT: &str = "jit.timeout";
    pub const HAS_REVIEW: &str = "review.has_review";
    pub const REVIEW_ID: &str = "review.id";
    pub const CLIENT_REQUEST_PORT: &str = "client.request_port";
    pub const DLP_SUMMARY: &str = "dlp.transformation_summary";
    pub const CONNECTION_PARAMS: &str = "agent.connection_params";
    pub const EXIT_CODE: &str = "terminal.exit_code";

    /// Handshake keys carried by the first `Gateway::Connect` packet
    pub mod handshake {
        pub const ORIGIN: &str = "origin";
        pub const AUTHORIZATION: &str = "authorization";
        pub const CONNECTION_NAME: &str = "connection_name";
        pub const SESSION_ID: &str = "session_id";
        pub const VERB: &str = "verb";
        pub const HOSTNAME: &str = "hostname";
        pub const CLIENT_ID: &str = "client_id";
        pub const VERSION: &str = "version";
    }
}

impl Packet {
    pub fn new(component: Component, packet_type: impl Into<String>) -> Self {
        Self {
            component,
            packet_type: packet_type.into(),
            payload: Vec::new(),
            spec: HashMap::new(),
        }
    }

    /// A gateway-originated packet
    pub fn gateway(packet_type: impl Into<String>) -> Self {
        Self::new(Component::Gateway, packet_type)
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_spec(mut self, key: impl Into<String>, val: impl Into<Vec<u8>>) -> Self {
        self.spec.insert(key.into(), val.into());
        self
    }

    /// Read a spec entry as utf-8, `None` when missing or not valid text
    pub fn spec_str(&self, key: &str) -> Option<&str> {
        self.spec
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.spec_str(spec::SESSION_ID).filter(|s| !s.is_empty())
    }

    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Encode the packet body (without the outer length frame)
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a packet body produced by [`Packet::encode`]
    pub fn decode(src: &[u8]) -> Result<Self, PacketError> {
        let pkt: Packet = serde_json::from_slice(src)?;
        if pkt.packet_type.is_empty() {
            return Err(PacketError::MissingType);
        }
        Ok(pkt)
    }
}
