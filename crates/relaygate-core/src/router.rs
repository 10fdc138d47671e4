//! Session router — live agent and client streams, and relaying between them

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::context::AgentMode;
use crate::packet::Packet;
use crate::stream::{PacketSender, StreamError};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("{kind} stream {id} is not bound")]
    NotFound { kind: &'static str, id: String },

    #[error("relaying to {id} failed: {source}")]
    Send {
        id: String,
        #[source]
        source: StreamError,
    },
}

impl RouterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RouterError::NotFound { .. })
    }
}

/// Router key of an agent stream.
///
/// Multi-connection agents hold one stream per connection, keyed by a
/// deterministic id derived from the agent and connection name.
pub fn agent_stream_id(agent_id: &str, mode: AgentMode, connection_name: &str) -> String {
    match mode {
        AgentMode::Standard => agent_id.to_string(),
        AgentMode::MultiConnection => Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{agent_id}:{connection_name}").as_bytes(),
        )
        .to_string(),
    }
}

fn same_stream(a: &Arc<dyn PacketSender>, b: &Arc<dyn PacketSender>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[derive(Default)]
struct Bindings {
    agents: HashMap<String, Arc<dyn PacketSender>>,
    clients: HashMap<String, Arc<dyn PacketSender>>,
}

/// Bound streams, keyed by agent stream id and client session id
#[derive(Default)]
pub struct SessionRouter {
    bindings: Mutex<Bindings>,
}

impl SessionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn bindings(&self) -> MutexGuard<'_, Bindings> {
        self.bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind an agent stream, returning a previously bound one
    pub fn bind_agent(
        &self,
        id: &str,
        stream: Arc<dyn PacketSender>,
    ) -> Option<Arc<dyn PacketSender>> {
        debug!("binding agent stream {} ({})", id, stream.peer());
        self.bindings().agents.insert(id.to_string(), stream)
    }

    /// Unbind only if `stream` is still the one bound under `id`
    pub fn unbind_agent(&self, id: &str, stream: &Arc<dyn PacketSender>) -> bool {
        let mut bindings = self.bindings();
        let current = bindings
            .agents
            .get(id)
            .is_some_and(|bound| same_stream(bound, stream));
        if current {
            bindings.agents.remove(id);
            debug!("unbound agent stream {}", id);
        }
        current
    }

    pub fn bind_client(
        &self,
        sid: &str,
        stream: Arc<dyn PacketSender>,
    ) -> Option<Arc<dyn PacketSender>> {
        debug!("binding client stream {} ({})", sid, stream.peer());
        self.bindings().clients.insert(sid.to_string(), stream)
    }

    pub fn unbind_client(&self, sid: &str, stream: &Arc<dyn PacketSender>) -> bool {
        let mut bindings = self.bindings();
        let current = bindings
            .clients
            .get(sid)
            .is_some_and(|bound| same_stream(bound, stream));
        if current {
            bindings.clients.remove(sid);
            debug!("unbound client stream {}", sid);
        }
        current
    }

    pub fn agent(&self, id: &str) -> Option<Arc<dyn PacketSender>> {
        self.bindings().agents.get(id).cloned()
    }

    pub fn client(&self, sid: &str) -> Option<Arc<dyn PacketSender>> {
        self.bindings().clients.get(sid).cloned()
    }

    pub fn agent_count(&self) -> usize {
        self.bindings().agents.len()
    }

    pub fn client_count(&self) -> usize {
        self.bindings().clients.len()
    }

    pub async fn send_to_agent(&self, id: &str, pkt: Packet) -> Result<(), RouterError> {
        let stream = self.agent(id).ok_or_else(|| RouterError::NotFound {
            kind: "agent",
            id: id.to_string(),
        })?;
        stream.send(pkt).await.map_err(|source| RouterError::Send {
            id: id.to_string(),
            source,
        })
    }

    pub async fn send_to_client(&self, sid: &str, pkt: Packet) -> Result<(), RouterError> {
        let stream = self.client(sid).ok_or_else(|| RouterError::NotFound {
            kind: "client",
            id: sid.to_string(),
        })?;
        stream.send(pkt).await.map_err(|source| RouterError::Send {
            id: sid.to_string(),
            source,
        })
    }
}
