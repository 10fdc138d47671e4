//! Dispatcher state: lets a control-plane call drive a live proxy-manager stream
//!
//! A stream that reaches `ready` registers under its client id and gets a
//! [`DispatchReceiver`]. [`Dispatcher::open_session`] hands a request to that
//! stream in two bounded stages: the handoff (the stream's worker must pick
//! the request up within `handoff_timeout`, otherwise the stream is cancelled
//! and the caller told to retry) and the response (the worker reports the
//! outcome within `response_timeout`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::packet::Packet;

pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("proxy manager state {0} not found")]
    NotFound(String),

    #[error("timeout dispatching open session, forcing client to reconnect")]
    ForceReconnect,

    #[error("timeout waiting to open a session")]
    Timeout,

    #[error("stream went away before answering")]
    StreamGone,

    #[error("failed opening session: {0}")]
    OpenFailed(String),
}

/// Request issued by the control plane for one proxy-manager client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub id: String,
    #[serde(default)]
    pub connection_name: String,
    #[serde(default)]
    pub port: String,
    /// Requested access duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_duration: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Ready,
    Connected,
    Disconnected,
}

/// Observable state of one proxy-manager client
#[derive(Debug, Clone, Serialize)]
pub struct ClientState {
    pub id: String,
    pub status: ClientStatus,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    pub metadata: HashMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub handoff_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

type CancelFn = Box<dyn Fn() + Send + Sync>;

struct DispatcherState {
    generation: u64,
    request_tx: mpsc::Sender<PendingOpen>,
    cancel_fn: CancelFn,
    cancelled: AtomicBool,
}

impl DispatcherState {
    /// Invoke the stream's cancel function at most once
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            (self.cancel_fn)();
        }
    }
}

struct PendingOpen {
    request: ClientRequest,
    ack: oneshot::Sender<()>,
    reply: oneshot::Sender<Result<Option<Packet>, DispatchError>>,
}

/// An accepted open-session request, owned by the stream's worker
pub struct OpenRequest {
    pub request: ClientRequest,
    reply: Responder,
}

impl OpenRequest {
    pub fn into_parts(self) -> (ClientRequest, Responder) {
        (self.request, self.reply)
    }
}

/// Reports the outcome of an open-session request to the waiting caller
pub struct Responder {
    key: String,
    tx: oneshot::Sender<Result<Option<Packet>, DispatchError>>,
}

impl Responder {
    /// `Ok(None)` means connected, `Ok(Some(pkt))` carries an interim packet
    /// (e.g. waiting for approval). Never blocks; a caller that already gave
    /// up is logged.
    pub fn send(self, result: Result<Option<Packet>, DispatchError>) -> bool {
        if self.tx.send(result).is_err() {
            warn!(
                "dispatcher {} response dropped, caller no longer waiting",
                self.key
            );
            return false;
        }
        true
    }
}

/// Worker side of a registered dispatcher state
pub struct DispatchReceiver {
    key: String,
    generation: u64,
    rx: mpsc::Receiver<PendingOpen>,
}

impl DispatchReceiver {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the next open-session request; `None` once deregistered
    pub async fn recv(&mut self) -> Option<OpenRequest> {
        loop {
            let pending = self.rx.recv().await?;
            // a caller that timed out during handoff dropped its ack receiver
            if pending.ack.send(()).is_err() {
                debug!("dispatcher {} skipping abandoned request", self.key);
                continue;
            }
            return Some(OpenRequest {
                request: pending.request,
                reply: Responder {
                    key: self.key.clone(),
                    tx: pending.reply,
                },
            });
        }
    }
}

#[derive(Default)]
struct Tables {
    states: HashMap<String, Arc<DispatcherState>>,
    clients: HashMap<String, ClientState>,
}

/// Registry of dispatcher states and client statuses
pub struct Dispatcher {
    settings: DispatcherSettings,
    tables: Mutex<Tables>,
    generation: AtomicU64,
}

impl Dispatcher {
    pub fn new(settings: DispatcherSettings) -> Self {
        Self {
            settings,
            tables: Mutex::new(Tables::default()),
            generation: AtomicU64::new(1),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install the state of a stream that reached `ready`.
    ///
    /// A previous state under the same key is replaced and its stream cancelled.
    pub fn register<F>(
        &self,
        key: &str,
        session_id: &str,
        metadata: HashMap<String, String>,
        cancel_fn: F,
    ) -> DispatchReceiver
    where
        F: Fn() + Send + Sync + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let (request_tx, rx) = mpsc::channel(1);
        let state = Arc::new(DispatcherState {
            generation,
            request_tx,
            cancel_fn: Box::new(cancel_fn),
            cancelled: AtomicBool::new(false),
        });
        let previous = {
            let mut tables = self.tables();
            tables.clients.insert(
                key.to_string(),
                ClientState {
                    id: key.to_string(),
                    status: ClientStatus::Ready,
                    session_id: session_id.to_string(),
                    connection_name: None,
                    metadata,
                    updated_at: Utc::now(),
                },
            );
            tables.states.insert(key.to_string(), state)
        };
        if let Some(previous) = previous {
            info!("dispatcher {} replaced, cancelling previous stream", key);
            previous.cancel();
        }
        DispatchReceiver {
            key: key.to_string(),
            generation,
            rx,
        }
    }

    /// Remove the receiver's state if it is still the registered one
    pub fn deregister(&self, receiver: &DispatchReceiver) -> bool {
        let mut tables = self.tables();
        let current = tables
            .states
            .get(&receiver.key)
            .is_some_and(|s| s.generation == receiver.generation);
        if !current {
            return false;
        }
        tables.states.remove(&receiver.key);
        if let Some(client) = tables.clients.get_mut(&receiver.key) {
            client.status = ClientStatus::Disconnected;
            client.updated_at = Utc::now();
        }
        true
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.tables().states.contains_key(key)
    }

    pub fn status(&self, key: &str) -> Option<ClientState> {
        self.tables().clients.get(key).cloned()
    }

    pub fn mark_connected(&self, key: &str, connection_name: &str) {
        let mut tables = self.tables();
        if let Some(client) = tables.clients.get_mut(key) {
            client.status = ClientStatus::Connected;
            client.connection_name = Some(connection_name.to_string());
            client.updated_at = Utc::now();
        }
    }

    /// Drive the stream registered under `req.id` to open a session
    pub async fn open_session(&self, req: ClientRequest) -> Result<Option<Packet>, DispatchError> {
        let key = req.id.clone();
        let state = self
            .tables()
            .states
            .get(&key)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(key.clone()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingOpen {
            request: req,
            ack: ack_tx,
            reply: reply_tx,
        };
        let handoff = async {
            state.request_tx.send(pending).await.ok()?;
            ack_rx.await.ok()
        };
        match timeout(self.settings.handoff_timeout, handoff).await {
            Ok(Some(())) => {}
            _ => {
                info!(
                    "dispatcher {} handoff not taken within {:?}, forcing reconnect",
                    key, self.settings.handoff_timeout
                );
                state.cancel();
                return Err(DispatchError::ForceReconnect);
            }
        }

        match timeout(self.settings.response_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::StreamGone),
            Err(_) => {
                warn!(
                    "dispatcher {} no response within {:?}",
                    key, self.settings.response_timeout
                );
                Err(DispatchError::Timeout)
            }
        }
    }

    /// Remove the state and cancel its stream; a missing key is not an error
    pub fn disconnect(&self, req: &ClientRequest) -> Result<(), DispatchError> {
        let removed = {
            let mut tables = self.tables();
            let removed = tables.states.remove(&req.id);
            if removed.is_some() {
                if let Some(client) = tables.clients.get_mut(&req.id) {
                    client.status = ClientStatus::Disconnected;
                    client.updated_at = Utc::now();
                }
            }
            removed
        };
        match removed {
            Some(state) => {
                info!("dispatcher {} disconnect requested", req.id);
                state.cancel();
            }
            None => debug!("dispatcher {} already disconnected", req.id),
        }
        Ok(())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherSettings::default())
    }
}
