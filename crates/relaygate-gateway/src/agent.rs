//! Agent streams — bound in the router, their packets routed to session workers

use std::sync::Arc;
use tracing::{debug, info, warn};

use relaygate_core::context::AgentMode;
use relaygate_core::packet::{Component, Packet, spec, types};
use relaygate_core::router::agent_stream_id;
use relaygate_core::stream::{PacketSender, PacketStream, spawn_reader};

use crate::auth::{AuthError, Handshake, Identity};
use crate::server::{GatewayState, reject};
use crate::sessions::ForwardOutcome;

/// Payload of the close packet sent to sessions whose agent went away
pub const AGENT_DISCONNECTED: &str = "agent disconnected";

pub(crate) async fn serve_agent(
    state: &Arc<GatewayState>,
    stream: &Arc<PacketStream>,
    handshake: &Handshake,
    identity: &Identity,
) {
    if identity.agent_mode == AgentMode::MultiConnection && handshake.connection_name.is_empty() {
        let err = AuthError::InvalidArgument(
            "multi-connection agents must announce a connection_name".to_string(),
        );
        reject(stream, &err).await;
        return;
    }
    let key = agent_stream_id(&identity.id, identity.agent_mode, &handshake.connection_name);
    let sender: Arc<dyn PacketSender> = stream.clone();
    if let Some(previous) = state.router.bind_agent(&key, sender.clone()) {
        warn!(
            "agent stream {} replaced, disconnecting {}",
            key,
            previous.peer()
        );
        previous.context().cancel();
    }
    info!(
        "agent connected: org={} id={} name={} key={} peer={} version={}",
        identity.org_id,
        identity.id,
        identity.name,
        key,
        stream.peer(),
        handshake.version
    );

    let reason = match stream.send(Packet::gateway(types::GATEWAY_CONNECT_OK)).await {
        Ok(()) => relay_agent_packets(state, stream, &key).await,
        Err(e) => e.to_string(),
    };

    if state.router.unbind_agent(&key, &sender) {
        let affected = state.sessions.opened_by_agent(&key);
        if !affected.is_empty() {
            info!(
                "agent {} gone, closing {} sessions",
                key,
                affected.len()
            );
        }
        for sid in affected {
            let close = Packet::new(Component::Agent, types::SESSION_CLOSE)
                .with_payload(AGENT_DISCONNECTED)
                .with_spec(spec::SESSION_ID, sid.as_str());
            if state.sessions.forward_from_agent(&sid, close).await == ForwardOutcome::NoSession {
                debug!("session {} already closed", sid);
            }
        }
    }
    info!("agent {} disconnected: {}", key, reason);
}

/// Route packets until the stream ends; returns why it ended
async fn relay_agent_packets(
    state: &Arc<GatewayState>,
    stream: &Arc<PacketStream>,
    key: &str,
) -> String {
    let mut rx = spawn_reader(stream.clone(), state.settings.reader_handoff);
    while let Some(item) = rx.recv().await {
        let pkt = match item {
            Ok(pkt) => pkt,
            Err(e) => {
                if !e.is_terminal() {
                    warn!("agent {} stream error: {}", key, e);
                }
                return e.to_string();
            }
        };
        if pkt.is_type(types::KEEP_ALIVE) {
            continue;
        }
        let Some(sid) = pkt.session_id().map(str::to_string) else {
            debug!("agent {} sent {} without a session id", key, pkt.packet_type);
            continue;
        };
        state.sessions.forward_from_agent(&sid, pkt).await;
    }
    "reader stopped".to_string()
}
