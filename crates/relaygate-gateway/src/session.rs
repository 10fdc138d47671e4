//! Client and proxy-manager sessions
//!
//! One [`SessionWorker`] owns a session: its context, its resolved plugin
//! pipeline and both directions of traffic. Client packets arrive through the
//! stream's reader worker, agent packets through the session table. Every
//! packet of the session runs through the pipeline on this worker, so plugins
//! observe the session in order.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use relaygate_core::context::{ClientOrigin, ContextError, Lifetime, LifetimeEnd, SessionContext};
use relaygate_core::dispatcher::{DispatchError, DispatchReceiver, OpenRequest};
use relaygate_core::packet::{Component, Packet, spec, types};
use relaygate_core::plugin::{Pipeline, Received};
use relaygate_core::router::{RouterError, agent_stream_id};
use relaygate_core::stream::{PacketSender, PacketStream, StreamError, spawn_reader};

use crate::auth::{AuthError, Handshake, Identity, ResolvedConnection};
use crate::server::{GatewayState, reject};
use crate::sessions::{ActiveSession, SESSION_QUEUE};

pub const AGENT_OFFLINE: &str = "agent is offline";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Invalid(#[from] ContextError),

    #[error("{0}")]
    Rejected(String),

    #[error("session {0} already exists")]
    AlreadyExists(String),
}

impl SessionError {
    pub fn to_packet(&self) -> Packet {
        let code = match self {
            SessionError::Invalid(_) => "invalid-argument",
            SessionError::Rejected(_) => "permission-denied",
            SessionError::AlreadyExists(_) => "already-exists",
        };
        Packet::gateway(types::GATEWAY_CONNECT_ERR)
            .with_payload(self.to_string())
            .with_spec(spec::ERROR_CODE, code)
    }
}

/// Connection details handed to the agent with session-open
#[derive(Debug, Serialize)]
struct AgentConnectionParams<'a> {
    connection_name: &'a str,
    connection_type: &'a str,
    connection_subtype: &'a str,
    user_id: &'a str,
    env_vars: &'a HashMap<String, String>,
    command: &'a [String],
    client_verb: &'a str,
}

/// Result of processing a session-open packet
#[derive(Debug)]
pub enum OpenOutcome {
    /// A plugin answered instead (e.g. waiting for approval)
    Intercepted(Packet),
    Opened,
    AgentOffline,
}

/// Identity of a session being created
pub struct SessionSeed<'a> {
    pub sid: String,
    pub origin: ClientOrigin,
    pub verb: &'a str,
    pub identity: &'a Identity,
    pub connection: ResolvedConnection,
}

pub struct SessionWorker {
    state: Arc<GatewayState>,
    client: Arc<dyn PacketSender>,
    ctx: SessionContext,
    pipeline: Pipeline,
    agent_key: String,
    agent_rx: mpsc::Receiver<Packet>,
    opened: bool,
    agent_closed: bool,
}

impl SessionWorker {
    /// Build the session context, run the connect phase and register the session
    pub async fn connect(
        state: &Arc<GatewayState>,
        stream: &Arc<PacketStream>,
        seed: SessionSeed<'_>,
    ) -> Result<Self, SessionError> {
        let SessionSeed {
            sid,
            origin,
            verb,
            identity,
            connection: conn,
        } = seed;
        if state.sessions.contains(&sid) {
            return Err(SessionError::AlreadyExists(sid));
        }

        let mut ctx = SessionContext::new(sid.clone(), origin);
        ctx.org_id = identity.org_id.clone();
        ctx.user_id = identity.id.clone();
        ctx.user_name = identity.name.clone();
        ctx.user_email = identity.email.clone();
        ctx.user_groups = identity.groups.clone();
        ctx.connection_id = conn.id;
        ctx.connection_name = conn.name;
        ctx.connection_type = conn.connection_type;
        ctx.connection_subtype = conn.subtype;
        ctx.connection_command = conn.command;
        ctx.connection_secret = conn.secrets;
        ctx.agent_id = conn.agent_id;
        ctx.agent_name = conn.agent_name;
        ctx.agent_mode = conn.agent_mode;
        ctx.client_verb = verb.to_string();
        ctx.lifetime = Lifetime::from_token(stream.context().child_token());
        ctx.validate()?;

        let pipeline = state
            .plugins
            .resolve(state.plugin_config.as_ref(), &ctx.connection_id)
            .await;
        if let Err(e) = pipeline.on_connect(&mut ctx).await {
            let msg = e.peer_message();
            pipeline.on_disconnect(&mut ctx, Some(msg.as_str())).await;
            return Err(SessionError::Rejected(msg));
        }

        let agent_key = agent_stream_id(&ctx.agent_id, ctx.agent_mode, &ctx.connection_name);
        let (agent_tx, agent_rx) = mpsc::channel(SESSION_QUEUE);
        let inserted = state.sessions.insert(ActiveSession {
            sid: sid.clone(),
            agent_key: agent_key.clone(),
            connection_name: ctx.connection_name.clone(),
            user_id: ctx.user_id.clone(),
            origin,
            opened: false,
            started_at: ctx.started_at,
            lifetime: ctx.lifetime.token(),
            agent_tx,
        });
        if !inserted {
            let err = SessionError::AlreadyExists(sid);
            pipeline.on_disconnect(&mut ctx, Some(err.to_string().as_str())).await;
            return Err(err);
        }

        let client: Arc<dyn PacketSender> = stream.clone();
        state.router.bind_client(&sid, client.clone());
        info!(
            "session {} connected: user={} connection={} origin={} verb={}",
            sid, ctx.user_email, ctx.connection_name, origin, ctx.client_verb
        );
        Ok(Self {
            state: state.clone(),
            client,
            ctx,
            pipeline,
            agent_key,
            agent_rx,
            opened: false,
            agent_closed: false,
        })
    }

    pub fn sid(&self) -> &str {
        &self.ctx.sid
    }

    async fn send_client(&self, pkt: Packet) {
        if let Err(e) = self.client.send(pkt).await {
            debug!("session {} client send failed: {}", self.ctx.sid, e);
        }
    }

    async fn close_client(&self, reason: &str) {
        let pkt = Packet::gateway(types::SESSION_CLOSE)
            .with_payload(reason)
            .with_spec(spec::SESSION_ID, self.ctx.sid.as_str());
        self.send_client(pkt).await;
    }

    /// Run the pipeline for a session-open and, when nothing intercepts it,
    /// open the session on the agent
    pub async fn process_session_open(&mut self, pkt: Packet) -> Result<OpenOutcome, String> {
        let pkt = match self.pipeline.on_receive(&mut self.ctx, pkt).await {
            Err(e) => {
                let msg = e.peer_message();
                self.close_client(&msg).await;
                return Err(msg);
            }
            Ok(Received::Reply(reply)) => {
                self.send_client(reply.clone()).await;
                return Ok(OpenOutcome::Intercepted(reply));
            }
            Ok(Received::Relay(pkt)) => pkt,
        };

        let Some(agent) = self.state.router.agent(&self.agent_key) else {
            info!(
                "session {} agent {} is offline",
                self.ctx.sid, self.ctx.agent_id
            );
            let offline = Packet::gateway(types::SESSION_OPEN_AGENT_OFFLINE)
                .with_spec(spec::SESSION_ID, self.ctx.sid.as_str())
                .with_spec(spec::CONNECTION_TYPE, self.ctx.connection_type.as_str());
            self.send_client(offline).await;
            return Ok(OpenOutcome::AgentOffline);
        };

        let params = AgentConnectionParams {
            connection_name: &self.ctx.connection_name,
            connection_type: &self.ctx.connection_type,
            connection_subtype: &self.ctx.connection_subtype,
            user_id: &self.ctx.user_id,
            env_vars: &self.ctx.connection_secret,
            command: &self.ctx.connection_command,
            client_verb: &self.ctx.client_verb,
        };
        let params = serde_json::to_vec(&params)
            .map_err(|e| format!("failed encoding connection params: {e}"))?;
        let mut open = Packet::gateway(types::SESSION_OPEN)
            .with_payload(pkt.payload)
            .with_spec(spec::SESSION_ID, self.ctx.sid.as_str())
            .with_spec(spec::CONNECTION_TYPE, self.ctx.connection_type.as_str())
            .with_spec(spec::CONNECTION_NAME, self.ctx.connection_name.as_str())
            .with_spec(spec::CONNECTION_PARAMS, params);
        // client spec may not replace the gateway's own entries
        for (key, value) in pkt.spec {
            open.spec.entry(key).or_insert(value);
        }
        if let Err(e) = agent.send(open).await {
            let msg = format!("failed opening session on agent: {e}");
            self.close_client(&msg).await;
            return Err(msg);
        }
        self.opened = true;
        self.state.sessions.mark_opened(&self.ctx.sid);
        info!(
            "session {} opened on agent {}",
            self.ctx.sid, self.agent_key
        );
        Ok(OpenOutcome::Opened)
    }

    /// Handle one client packet; `Err` ends the session
    async fn handle_client_packet(&mut self, mut pkt: Packet) -> Result<(), String> {
        if pkt.is_type(types::KEEP_ALIVE) {
            return Ok(());
        }
        pkt.spec
            .insert(spec::SESSION_ID.to_string(), self.ctx.sid.clone().into_bytes());

        if pkt.is_type(types::SESSION_OPEN) {
            if self.opened {
                debug!("session {} already open, ignoring session-open", self.ctx.sid);
                return Ok(());
            }
            return self.process_session_open(pkt).await.map(|_| ());
        }
        if !self.opened {
            debug!(
                "session {} dropping {} before open",
                self.ctx.sid, pkt.packet_type
            );
            return Ok(());
        }

        let pkt = match self.pipeline.on_receive(&mut self.ctx, pkt).await {
            Err(e) => {
                let msg = e.peer_message();
                self.close_client(&msg).await;
                return Err(msg);
            }
            Ok(Received::Reply(reply)) => {
                self.send_client(reply).await;
                return Ok(());
            }
            Ok(Received::Relay(pkt)) => pkt,
        };
        match self.state.router.send_to_agent(&self.agent_key, pkt).await {
            Ok(()) => Ok(()),
            Err(RouterError::NotFound { .. }) => {
                let msg = format!("agent not found for connection {}", self.ctx.connection_name);
                self.close_client(&msg).await;
                Err(msg)
            }
            Err(e) => {
                let msg = e.to_string();
                self.close_client(&msg).await;
                Err(msg)
            }
        }
    }

    /// Handle one agent packet; `Some(err)` ends the session
    async fn handle_agent_packet(&mut self, pkt: Packet) -> Option<Option<String>> {
        let close = pkt.is_type(types::SESSION_CLOSE).then(|| {
            (!pkt.payload.is_empty()).then(|| String::from_utf8_lossy(&pkt.payload).into_owned())
        });
        let out = match self.pipeline.on_receive(&mut self.ctx, pkt).await {
            Err(e) => {
                let msg = e.peer_message();
                self.close_client(&msg).await;
                return Some(Some(msg));
            }
            Ok(received) => received.into_packet(),
        };
        if let Err(e) = self.client.send(out).await {
            return Some(Some(format!("relaying to client failed: {e}")));
        }
        if close.is_some() {
            self.agent_closed = true;
        }
        close
    }

    /// Drive the session until it ends, then run the disconnect phase
    pub async fn run(
        mut self,
        mut client_rx: mpsc::Receiver<Result<Packet, StreamError>>,
    ) -> Option<String> {
        let err = loop {
            let lifetime = self.ctx.lifetime.clone();
            tokio::select! {
                end = lifetime.done() => match end {
                    LifetimeEnd::DeadlineExceeded => {
                        info!("session {} lifetime expired", self.ctx.sid);
                        let timeout = Packet::gateway(types::SESSION_OPEN_TIMEOUT)
                            .with_spec(spec::SESSION_ID, self.ctx.sid.as_str());
                        self.send_client(timeout).await;
                        break None;
                    }
                    LifetimeEnd::Cancelled => break Some("session cancelled".to_string()),
                },
                item = client_rx.recv() => match item {
                    Some(Ok(pkt)) => {
                        if let Err(e) = self.handle_client_packet(pkt).await {
                            break Some(e);
                        }
                    }
                    Some(Err(e)) if e.is_terminal() => {
                        debug!("session {} client stream ended: {}", self.ctx.sid, e);
                        break None;
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("client reader stopped".to_string()),
                },
                Some(pkt) = self.agent_rx.recv() => {
                    if let Some(end) = self.handle_agent_packet(pkt).await {
                        break end;
                    }
                }
            }
        };
        self.finish(err).await
    }

    /// Disconnect phase: release the agent side, unbind and run plugin hooks
    pub async fn finish(mut self, err: Option<String>) -> Option<String> {
        let sid = self.ctx.sid.clone();
        if self.opened && !self.agent_closed {
            let close = Packet::new(Component::Gateway, types::SESSION_CLOSE)
                .with_spec(spec::SESSION_ID, sid.as_str());
            match self.state.router.send_to_agent(&self.agent_key, close).await {
                Ok(()) | Err(RouterError::NotFound { .. }) => {}
                Err(e) => debug!("session {} close not sent to agent: {}", sid, e),
            }
        }
        self.state.router.unbind_client(&sid, &self.client);
        self.state.sessions.remove(&sid);
        self.pipeline.on_disconnect(&mut self.ctx, err.as_deref()).await;
        self.ctx.lifetime.cancel();
        match &err {
            Some(e) => info!("session {} closed: {}", sid, e),
            None => info!("session {} closed", sid),
        }
        err
    }
}

async fn resolve_connection(
    state: &GatewayState,
    org_id: &str,
    name: &str,
) -> Result<ResolvedConnection, AuthError> {
    if name.is_empty() {
        return Err(AuthError::InvalidArgument("missing connection_name".to_string()));
    }
    state
        .connections
        .find(org_id, name)
        .await
        .ok_or_else(|| AuthError::NotFound(format!("connection '{}' not found", name)))
}

pub(crate) async fn serve_client(
    state: &Arc<GatewayState>,
    stream: &Arc<PacketStream>,
    handshake: &Handshake,
    identity: &Identity,
) {
    let conn = match resolve_connection(state, &identity.org_id, &handshake.connection_name).await {
        Ok(conn) => conn,
        Err(e) => return reject(stream, &e).await,
    };
    let sid = if handshake.session_id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        handshake.session_id.clone()
    };
    let seed = SessionSeed {
        sid,
        origin: ClientOrigin::Client,
        verb: &handshake.verb,
        identity,
        connection: conn,
    };
    let worker = match SessionWorker::connect(state, stream, seed).await {
        Ok(worker) => worker,
        Err(e) => {
            warn!("client {} refused: {}", stream.peer(), e);
            if let Err(send_err) = stream.send(e.to_packet()).await {
                debug!("refusal not delivered to {}: {}", stream.peer(), send_err);
            }
            return;
        }
    };

    let ok = Packet::gateway(types::GATEWAY_CONNECT_OK).with_spec(spec::SESSION_ID, worker.sid());
    if let Err(e) = stream.send(ok).await {
        worker.finish(Some(e.to_string())).await;
        return;
    }
    let client_rx = spawn_reader(stream.clone(), state.settings.reader_handoff);
    worker.run(client_rx).await;
}

/// Waits for the next dispatcher request once the stream is ready
async fn next_request(receiver: &mut Option<DispatchReceiver>) -> Option<OpenRequest> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn serve_proxy_manager(
    state: &Arc<GatewayState>,
    stream: &Arc<PacketStream>,
    handshake: &Handshake,
    identity: &Identity,
) {
    let client_id = if handshake.client_id.is_empty() {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, identity.id.as_bytes()).to_string()
    } else {
        handshake.client_id.clone()
    };
    if let Err(e) = stream
        .send(Packet::gateway(types::PROXY_MANAGER_CONNECT_OK))
        .await
    {
        debug!("proxymanager {} went away: {}", client_id, e);
        return;
    }
    info!(
        "proxymanager {} connected: user={} hostname={}",
        client_id, identity.email, handshake.hostname
    );

    let sid = Uuid::new_v4().to_string();
    let lifetime = stream.context();
    let mut client_rx = spawn_reader(stream.clone(), state.settings.reader_handoff);
    let mut dispatch: Option<DispatchReceiver> = None;

    let request = loop {
        tokio::select! {
            _ = lifetime.cancelled() => break None,
            item = client_rx.recv() => match item {
                Some(Ok(pkt)) if pkt.is_type(types::PROXY_MANAGER_CONNECT_OK_ACK) => {
                    if dispatch.is_none() {
                        let cancel = lifetime.clone();
                        dispatch = Some(state.dispatcher.register(
                            &client_id,
                            &sid,
                            handshake.metadata(),
                            move || cancel.cancel(),
                        ));
                        info!("proxymanager {} is ready, session {}", client_id, sid);
                    }
                }
                Some(Ok(pkt)) => {
                    if !pkt.is_type(types::KEEP_ALIVE) {
                        debug!("proxymanager {} ignoring {} while idle", client_id, pkt.packet_type);
                    }
                }
                Some(Err(e)) => {
                    debug!("proxymanager {} stream ended: {}", client_id, e);
                    break None;
                }
                None => break None,
            },
            Some(req) = next_request(&mut dispatch) => break Some(req),
        }
    };

    if let Some(open) = request {
        run_proxy_session(state, stream, identity, &client_id, sid, open, client_rx).await;
    }
    if let Some(receiver) = dispatch {
        state.dispatcher.deregister(&receiver);
    }
    info!("proxymanager {} disconnected", client_id);
}

async fn run_proxy_session(
    state: &Arc<GatewayState>,
    stream: &Arc<PacketStream>,
    identity: &Identity,
    client_id: &str,
    sid: String,
    open: OpenRequest,
    client_rx: mpsc::Receiver<Result<Packet, StreamError>>,
) {
    let (request, responder) = open.into_parts();
    info!(
        "proxymanager {} starting connect phase for {}",
        client_id, request.connection_name
    );
    let conn = match resolve_connection(state, &identity.org_id, &request.connection_name).await {
        Ok(conn) => conn,
        Err(e) => {
            responder.send(Err(DispatchError::OpenFailed(e.to_string())));
            return;
        }
    };
    let connection_name = conn.name.clone();
    let seed = SessionSeed {
        sid: sid.clone(),
        origin: ClientOrigin::ClientProxyManager,
        verb: "connect",
        identity,
        connection: conn,
    };
    let mut worker = match SessionWorker::connect(state, stream, seed).await {
        Ok(worker) => worker,
        Err(e) => {
            responder.send(Err(DispatchError::OpenFailed(e.to_string())));
            return;
        }
    };

    let mut open_pkt = Packet::new(Component::Client, types::SESSION_OPEN)
        .with_spec(spec::SESSION_ID, sid.as_str())
        .with_spec(spec::CLIENT_REQUEST_PORT, request.port.as_str());
    if let Some(secs) = request.access_duration {
        open_pkt = open_pkt.with_spec(spec::JIT_TIMEOUT, secs.to_string());
    }
    match worker.process_session_open(open_pkt).await {
        Ok(OpenOutcome::Opened) => {
            state.dispatcher.mark_connected(client_id, &connection_name);
            responder.send(Ok(None));
        }
        Ok(OpenOutcome::Intercepted(reply)) => {
            responder.send(Ok(Some(reply)));
        }
        Ok(OpenOutcome::AgentOffline) => {
            responder.send(Err(DispatchError::OpenFailed(AGENT_OFFLINE.to_string())));
            worker.finish(Some(AGENT_OFFLINE.to_string())).await;
            return;
        }
        Err(msg) => {
            responder.send(Err(DispatchError::OpenFailed(msg.clone())));
            worker.finish(Some(msg)).await;
            return;
        }
    }
    worker.run(client_rx).await;
}
