//! Stream handshake and the identity / connection collaborators
//!
//! The first packet on every connection is a `Gateway::Connect` packet. Its
//! spec carries the peer's origin and a bearer credential, which an
//! [`IdentityProvider`] resolves into an [`Identity`].

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use relaygate_core::config::{GatewayConfig, IdentityKind};
use relaygate_core::context::{AgentMode, ClientOrigin, ContextError};
use relaygate_core::packet::{Component, Packet, spec, types};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing origin")]
    MissingOrigin,

    #[error("{0}")]
    InvalidArgument(String),

    #[error("invalid authentication")]
    Unauthenticated,

    #[error("{0}")]
    NotFound(String),
}

impl AuthError {
    /// Value of the error code spec entry of the rejection packet
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingOrigin | AuthError::InvalidArgument(_) => "invalid-argument",
            AuthError::Unauthenticated => "unauthenticated",
            AuthError::NotFound(_) => "not-found",
        }
    }

    pub fn to_packet(&self) -> Packet {
        Packet::gateway(types::GATEWAY_CONNECT_ERR)
            .with_payload(self.to_string())
            .with_spec(spec::ERROR_CODE, self.code())
    }
}

/// Attributes announced by a peer in its connect packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub origin: ClientOrigin,
    pub token: String,
    pub connection_name: String,
    pub session_id: String,
    pub verb: String,
    pub hostname: String,
    pub client_id: String,
    pub version: String,
}

impl Handshake {
    pub fn parse(pkt: &Packet) -> Result<Self, AuthError> {
        if !pkt.is_type(types::GATEWAY_CONNECT) {
            return Err(AuthError::InvalidArgument(format!(
                "expected {} packet, got {}",
                types::GATEWAY_CONNECT,
                pkt.packet_type
            )));
        }
        let attr = |key: &str| pkt.spec_str(key).unwrap_or_default().trim().to_string();

        let origin = attr(spec::handshake::ORIGIN);
        if origin.is_empty() {
            return Err(AuthError::MissingOrigin);
        }
        let origin: ClientOrigin = origin
            .parse()
            .map_err(|e: ContextError| AuthError::InvalidArgument(e.to_string()))?;

        let authorization = attr(spec::handshake::AUTHORIZATION);
        let token = authorization
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Unauthenticated)?
            .to_string();

        Ok(Self {
            origin,
            token,
            connection_name: attr(spec::handshake::CONNECTION_NAME),
            session_id: attr(spec::handshake::SESSION_ID),
            verb: attr(spec::handshake::VERB),
            hostname: attr(spec::handshake::HOSTNAME),
            client_id: attr(spec::handshake::CLIENT_ID),
            version: attr(spec::handshake::VERSION),
        })
    }

    pub fn metadata(&self) -> HashMap<String, String> {
        let mut md = HashMap::new();
        for (key, value) in [
            ("hostname", &self.hostname),
            ("version", &self.version),
            ("verb", &self.verb),
        ] {
            if !value.is_empty() {
                md.insert(key.to_string(), value.clone());
            }
        }
        md
    }
}

/// Build a connect packet; used by peers and tests
pub fn connect_packet(origin: ClientOrigin, token: &str) -> Packet {
    Packet::new(
        match origin {
            ClientOrigin::Agent => Component::Agent,
            _ => Component::Client,
        },
        types::GATEWAY_CONNECT,
    )
    .with_spec(spec::handshake::ORIGIN, origin.as_str())
    .with_spec(spec::handshake::AUTHORIZATION, format!("Bearer {token}"))
}

/// A verified bearer credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub kind: IdentityKind,
    pub org_id: String,
    pub id: String,
    pub name: String,
    pub email: String,
    pub groups: Vec<String>,
    pub agent_mode: AgentMode,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Identity>;
}

/// Verify the handshake's credential and check it matches the origin
pub async fn authenticate(
    provider: &dyn IdentityProvider,
    handshake: &Handshake,
) -> Result<Identity, AuthError> {
    let identity = provider
        .verify(&handshake.token)
        .await
        .ok_or(AuthError::Unauthenticated)?;
    let expected = match handshake.origin {
        ClientOrigin::Agent => IdentityKind::Agent,
        ClientOrigin::Client | ClientOrigin::ClientProxyManager => IdentityKind::User,
    };
    if identity.kind != expected {
        return Err(AuthError::Unauthenticated);
    }
    Ok(identity)
}

/// Everything the gateway needs to open a session against a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConnection {
    pub id: String,
    pub name: String,
    pub connection_type: String,
    pub subtype: String,
    pub command: Vec<String>,
    pub secrets: HashMap<String, String>,
    pub agent_id: String,
    pub agent_name: String,
    pub agent_mode: AgentMode,
}

#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn find(&self, org_id: &str, name: &str) -> Option<ResolvedConnection>;
}

/// Identities and connections declared in the config file
#[derive(Debug, Default)]
pub struct StaticDirectory {
    by_token: HashMap<String, Identity>,
    connections: HashMap<String, ResolvedConnection>,
}

impl StaticDirectory {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut by_token = HashMap::new();
        let mut agents: HashMap<String, Identity> = HashMap::new();
        for entry in &config.identities {
            let identity = Identity {
                kind: entry.kind,
                org_id: entry.org_id.clone(),
                id: entry.id.clone(),
                name: if entry.name.is_empty() {
                    entry.id.clone()
                } else {
                    entry.name.clone()
                },
                email: entry.email.clone(),
                groups: entry.groups.clone(),
                agent_mode: entry.agent_mode,
            };
            if identity.kind == IdentityKind::Agent {
                agents.insert(identity.id.clone(), identity.clone());
            }
            by_token.insert(entry.token.clone(), identity);
        }

        let connections = config
            .connections
            .iter()
            .map(|conn| {
                let agent = agents.get(&conn.agent_id);
                let resolved = ResolvedConnection {
                    id: conn.connection_id().to_string(),
                    name: conn.name.clone(),
                    connection_type: conn.connection_type.clone(),
                    subtype: conn.subtype.clone(),
                    command: conn.command.clone(),
                    secrets: conn.secrets.clone(),
                    agent_id: conn.agent_id.clone(),
                    agent_name: agent.map(|a| a.name.clone()).unwrap_or_default(),
                    agent_mode: agent.map(|a| a.agent_mode).unwrap_or_default(),
                };
                (conn.name.clone(), resolved)
            })
            .collect();

        Self {
            by_token,
            connections,
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticDirectory {
    async fn verify(&self, token: &str) -> Option<Identity> {
        self.by_token.get(token).cloned()
    }
}

#[async_trait]
impl ConnectionResolver for StaticDirectory {
    async fn find(&self, _org_id: &str, name: &str) -> Option<ResolvedConnection> {
        self.connections.get(name).cloned()
    }
}

/// Compare two secrets without short-circuiting on the first differing byte
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
