//! Live sessions of this gateway, keyed by session id

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use relaygate_core::context::ClientOrigin;
use relaygate_core::packet::Packet;

/// How long an agent packet may wait for a busy session worker
pub const AGENT_FORWARD_WAIT: Duration = Duration::from_secs(1);

/// Capacity of the agent-to-session queue
pub const SESSION_QUEUE: usize = 64;

pub struct ActiveSession {
    pub sid: String,
    pub agent_key: String,
    pub connection_name: String,
    pub user_id: String,
    pub origin: ClientOrigin,
    pub opened: bool,
    pub started_at: DateTime<Utc>,
    pub lifetime: CancellationToken,
    pub agent_tx: mpsc::Sender<Packet>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub sid: String,
    pub connection_name: String,
    pub user_id: String,
    pub origin: ClientOrigin,
    pub opened: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered,
    NoSession,
    /// The worker did not take the packet in time and the session was cancelled
    Stalled,
}

#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, ActiveSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `false` if the session id is already taken
    pub fn insert(&self, session: ActiveSession) -> bool {
        let mut sessions = self.sessions();
        if sessions.contains_key(&session.sid) {
            return false;
        }
        sessions.insert(session.sid.clone(), session);
        true
    }

    pub fn remove(&self, sid: &str) -> bool {
        self.sessions().remove(sid).is_some()
    }

    pub fn contains(&self, sid: &str) -> bool {
        self.sessions().contains_key(sid)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn mark_opened(&self, sid: &str) {
        if let Some(session) = self.sessions().get_mut(sid) {
            session.opened = true;
        }
    }

    pub fn cancel(&self, sid: &str) -> bool {
        match self.sessions().get(sid) {
            Some(session) => {
                session.lifetime.cancel();
                true
            }
            None => false,
        }
    }

    /// Opened sessions routed through an agent stream
    pub fn opened_by_agent(&self, agent_key: &str) -> Vec<String> {
        self.sessions()
            .values()
            .filter(|s| s.opened && s.agent_key == agent_key)
            .map(|s| s.sid.clone())
            .collect()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions()
            .values()
            .map(|s| SessionSummary {
                sid: s.sid.clone(),
                connection_name: s.connection_name.clone(),
                user_id: s.user_id.clone(),
                origin: s.origin,
                opened: s.opened,
                started_at: s.started_at,
            })
            .collect();
        out.sort_by_key(|s| s.started_at);
        out
    }

    /// Hand a packet from the agent to the session's worker
    pub async fn forward_from_agent(&self, sid: &str, pkt: Packet) -> ForwardOutcome {
        let Some((tx, lifetime)) = self
            .sessions()
            .get(sid)
            .map(|s| (s.agent_tx.clone(), s.lifetime.clone()))
        else {
            debug!("session {} not found, dropping agent {}", sid, pkt.packet_type);
            return ForwardOutcome::NoSession;
        };
        match tx.send_timeout(pkt, AGENT_FORWARD_WAIT).await {
            Ok(()) => ForwardOutcome::Delivered,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(
                    "session {} stalled for {:?}, cancelling",
                    sid, AGENT_FORWARD_WAIT
                );
                lifetime.cancel();
                ForwardOutcome::Stalled
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => ForwardOutcome::NoSession,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygate_core::packet::types;

    fn session(sid: &str, agent_key: &str, capacity: usize) -> (ActiveSession, mpsc::Receiver<Packet>) {
        let (agent_tx, rx) = mpsc::channel(capacity);
        (
            ActiveSession {
                sid: sid.to_string(),
                agent_key: agent_key.to_string(),
                connection_name: "bash".to_string(),
                user_id: "u1".to_string(),
                origin: ClientOrigin::Client,
                opened: false,
                started_at: Utc::now(),
                lifetime: CancellationToken::new(),
                agent_tx,
            },
            rx,
        )
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let table = SessionTable::new();
        let (a, _rx_a) = session("s1", "agent", 1);
        let (b, _rx_b) = session("s1", "agent", 1);
        assert!(table.insert(a));
        assert!(!table.insert(b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_opened_by_agent() {
        let table = SessionTable::new();
        let (a, _rx_a) = session("s1", "agent-1", 1);
        let (b, _rx_b) = session("s2", "agent-1", 1);
        let (c, _rx_c) = session("s3", "agent-2", 1);
        for s in [a, b, c] {
            table.insert(s);
        }
        table.mark_opened("s1");
        table.mark_opened("s3");
        assert_eq!(table.opened_by_agent("agent-1"), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_forward_delivers() {
        let table = SessionTable::new();
        let (a, mut rx) = session("s1", "agent", 1);
        table.insert(a);
        let pkt = Packet::gateway(types::WRITE_STDOUT).with_payload("hi");
        assert_eq!(
            table.forward_from_agent("s1", pkt.clone()).await,
            ForwardOutcome::Delivered
        );
        assert_eq!(rx.recv().await.unwrap(), pkt);
        assert_eq!(
            table.forward_from_agent("nope", pkt).await,
            ForwardOutcome::NoSession
        );
    }

    #[tokio::test]
    async fn test_stalled_worker_cancels_session() {
        let table = SessionTable::new();
        let (a, _rx) = session("s1", "agent", 1);
        let lifetime = a.lifetime.clone();
        table.insert(a);
        let pkt = Packet::gateway(types::WRITE_STDOUT);
        assert_eq!(
            table.forward_from_agent("s1", pkt.clone()).await,
            ForwardOutcome::Delivered
        );
        assert_eq!(
            table.forward_from_agent("s1", pkt).await,
            ForwardOutcome::Stalled
        );
        assert!(lifetime.is_cancelled());
    }
}
