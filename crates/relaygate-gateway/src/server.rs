//! Transport server: accepts streams, authenticates them and hands them to workers

use anyhow::{Context, Result, anyhow};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relaygate_core::config::GatewayConfig;
use relaygate_core::context::ClientOrigin;
use relaygate_core::dispatcher::Dispatcher;
use relaygate_core::index::SessionIndex;
use relaygate_core::packet::{Packet, spec, types};
use relaygate_core::plugin::{PluginConfigSource, PluginRegistry, StartupContext};
use relaygate_core::plugins::review::{DENIED_MESSAGE, ReviewError};
use relaygate_core::plugins::{
    AccessControlPlugin, AuditPlugin, DataMaskingPlugin, IndexerPlugin, Review, ReviewBook,
    ReviewDecision, ReviewPlugin, ReviewStatus,
};
use relaygate_core::router::SessionRouter;
use relaygate_core::stream::{DEFAULT_HANDOFF_WAIT, PacketStream};
use relaygate_core::wal::{JsonFileStorageWriter, WalStore};

use crate::agent;
use crate::auth::{AuthError, ConnectionResolver, Handshake, IdentityProvider, StaticDirectory, authenticate};
use crate::session;
use crate::sessions::SessionTable;

/// How long in-flight streams get to wind down after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: String,
    pub control_addr: String,
    pub api_url: String,
    pub control_token: String,
    pub handshake_timeout: Duration,
    /// Bounded wait of each stream's reader worker
    pub reader_handoff: Duration,
}

impl ServerSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            listen_addr: config.server.listen_addr.clone(),
            control_addr: config.server.control_addr.clone(),
            api_url: config.server.api_url.clone(),
            control_token: config.server.control_token.clone(),
            handshake_timeout: config.server.handshake_timeout(),
            reader_handoff: DEFAULT_HANDOFF_WAIT,
        }
    }
}

/// Everything shared by the stream workers and the control API
pub struct GatewayState {
    pub settings: ServerSettings,
    pub identities: Arc<dyn IdentityProvider>,
    pub connections: Arc<dyn ConnectionResolver>,
    pub plugin_config: Arc<dyn PluginConfigSource>,
    pub plugins: PluginRegistry,
    pub router: SessionRouter,
    pub dispatcher: Dispatcher,
    pub reviews: Arc<ReviewBook>,
    pub wal: Arc<WalStore>,
    pub index: SessionIndex,
    pub sessions: SessionTable,
    pub shutdown: CancellationToken,
}

impl GatewayState {
    /// Wire the built-in plugins and collaborators described by `config`
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let settings = ServerSettings::from_config(config);
        let directory = Arc::new(StaticDirectory::from_config(config));
        let writer = Arc::new(JsonFileStorageWriter::new(config.storage_dir()));
        let wal = Arc::new(WalStore::new(config.wal_settings(), writer));
        let reviews = Arc::new(ReviewBook::new());
        let index = SessionIndex::new(config.index_orgs_dir());

        let plugins = PluginRegistry::new();
        plugins.register(Arc::new(AccessControlPlugin)).await;
        plugins
            .register(Arc::new(ReviewPlugin::new(
                reviews.clone(),
                settings.api_url.clone(),
            )))
            .await;
        plugins.register(Arc::new(AuditPlugin::new(wal.clone()))).await;
        plugins
            .register(Arc::new(IndexerPlugin::new(
                index.clone(),
                config.index_wal_settings(),
            )))
            .await;
        let dlp = DataMaskingPlugin::new().context("Failed to compile data masking rules")?;
        plugins.register(Arc::new(dlp)).await;

        Ok(Self {
            settings,
            identities: directory.clone(),
            connections: directory,
            plugin_config: Arc::new(config.plugin_source()),
            plugins,
            router: SessionRouter::new(),
            dispatcher: Dispatcher::new(config.dispatcher_settings()),
            reviews,
            wal,
            index,
            sessions: SessionTable::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Record a review decision and notify the waiting client
    pub async fn decide_review(
        &self,
        session_id: &str,
        group: Option<&str>,
        decision: ReviewDecision,
    ) -> Result<Review, ReviewError> {
        let review = self.reviews.decide(session_id, group, decision).await?;
        match review.status {
            ReviewStatus::Approved => {
                let pkt = Packet::gateway(types::SESSION_OPEN_APPROVE_OK)
                    .with_payload(review.input.clone())
                    .with_spec(spec::SESSION_ID, session_id);
                if let Err(e) = self.router.send_to_client(session_id, pkt).await {
                    warn!("session {} approval not delivered: {}", session_id, e);
                }
            }
            ReviewStatus::Rejected => {
                let pkt = Packet::gateway(types::SESSION_CLOSE)
                    .with_payload(DENIED_MESSAGE)
                    .with_spec(spec::SESSION_ID, session_id);
                if let Err(e) = self.router.send_to_client(session_id, pkt).await {
                    warn!("session {} rejection not delivered: {}", session_id, e);
                }
                self.sessions.cancel(session_id);
            }
            ReviewStatus::Pending | ReviewStatus::Processing => {}
        }
        Ok(review)
    }
}

pub struct GatewayServer {
    state: Arc<GatewayState>,
}

impl GatewayServer {
    pub fn new(state: GatewayState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        Ok(Self::new(GatewayState::from_config(config).await?))
    }

    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Cancel the accept loop and every stream lifetime
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = &self.state.settings.listen_addr;
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind gateway listener on {}", addr))
    }

    /// Start the plugins, then accept streams until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let startup = StartupContext {
            api_url: self.state.settings.api_url.clone(),
        };
        self.state
            .plugins
            .startup(&startup)
            .await
            .map_err(|e| anyhow!("plugin startup failed: {}", e))?;

        let local = listener.local_addr()?;
        info!(
            "Gateway listening on {} (plugins: {})",
            local,
            self.state.plugins.names().await.join(", ")
        );

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        loop {
            tokio::select! {
                _ = self.state.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        handles.retain(|h| !h.is_finished());
                        let state = self.state.clone();
                        handles.push(tokio::spawn(handle_connection(state, tcp, peer)));
                    }
                    Err(e) => {
                        error!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!("Gateway shutting down, {} streams open", handles.len());
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("streams still open after {:?}", DRAIN_TIMEOUT);
        }
        self.state.plugins.shutdown().await;
        Ok(())
    }
}

/// Reply to a rejected handshake with a single terminal packet
pub(crate) async fn reject(stream: &PacketStream, err: &AuthError) {
    warn!("rejecting {}: {}", stream.peer(), err);
    if let Err(e) = stream.send(err.to_packet()).await {
        debug!("rejection not delivered to {}: {}", stream.peer(), e);
    }
}

async fn handle_connection(state: Arc<GatewayState>, tcp: TcpStream, peer: SocketAddr) {
    if let Err(e) = tcp.set_nodelay(true) {
        debug!("set_nodelay on {}: {}", peer, e);
    }
    let stream = Arc::new(PacketStream::with_lifetime(
        tcp,
        peer.to_string(),
        state.shutdown.clone(),
    ));

    let first = match timeout(state.settings.handshake_timeout, stream.recv()).await {
        Ok(Ok(pkt)) => pkt,
        Ok(Err(e)) => {
            debug!("{} went away before the handshake: {}", peer, e);
            stream.close().await;
            return;
        }
        Err(_) => {
            let err = AuthError::InvalidArgument("handshake timeout".to_string());
            reject(&stream, &err).await;
            stream.close().await;
            return;
        }
    };

    let verified = match Handshake::parse(&first) {
        Ok(handshake) => authenticate(state.identities.as_ref(), &handshake)
            .await
            .map(|identity| (handshake, identity)),
        Err(e) => Err(e),
    };
    let (handshake, identity) = match verified {
        Ok(v) => v,
        Err(e) => {
            reject(&stream, &e).await;
            stream.close().await;
            return;
        }
    };
    debug!(
        "{} authenticated as {} ({})",
        peer, identity.id, handshake.origin
    );

    match handshake.origin {
        ClientOrigin::Agent => agent::serve_agent(&state, &stream, &handshake, &identity).await,
        ClientOrigin::Client => session::serve_client(&state, &stream, &handshake, &identity).await,
        ClientOrigin::ClientProxyManager => {
            session::serve_proxy_manager(&state, &stream, &handshake, &identity).await
        }
    }
    stream.close().await;
}
