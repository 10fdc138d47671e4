//! Plugin pipeline — ordered interception around connect, receive and disconnect
//!
//! Plugins are registered once, in a fixed order, on a [`PluginRegistry`].
//! At connect time a [`Pipeline`] is resolved for the session: every
//! registered plugin paired with its per-connection configuration. The
//! pipeline then drives the lifecycle hooks:
//!
//! - `on_connect` and `on_receive` stop at the first error
//! - before any receive hook runs, every plugin may `transform` the packet;
//!   later plugins, the relay and the client all see the rewritten packet
//! - `on_receive` stops at the first plugin that returns a response
//! - `on_disconnect` runs every plugin and only logs failures

pub mod config;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::context::{Lifetime, PluginConnectionConfig, SessionContext};
use crate::packet::Packet;

pub use config::{PluginConfigSource, StaticPluginConfig};

/// Errors a plugin may return from its hooks
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    /// Policy decision, surfaced to the peer as the reason the session ended
    #[error("{0}")]
    Rejected(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// A plugin failure tagged with the plugin that produced it
#[derive(Debug, Clone, Error)]
#[error("plugin {plugin}: {source}")]
pub struct PipelineError {
    pub plugin: String,
    #[source]
    pub source: PluginError,
}

impl PipelineError {
    /// Text shown to the peer whose session is ending
    pub fn peer_message(&self) -> String {
        self.source.to_string()
    }
}

/// Returned by a plugin to intercept a packet
#[derive(Debug, Default)]
pub struct PluginResponse {
    /// Replaces the session lifetime (e.g. a time-boxed approval)
    pub lifetime: Option<Lifetime>,
    /// Sent to the client instead of relaying the packet
    pub client_packet: Option<Packet>,
}

impl PluginResponse {
    pub fn reply(pkt: Packet) -> Self {
        Self {
            lifetime: None,
            client_packet: Some(pkt),
        }
    }

    pub fn lifetime(lifetime: Lifetime) -> Self {
        Self {
            lifetime: Some(lifetime),
            client_packet: None,
        }
    }
}

/// What the session does with a packet once the pipeline has run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Relay this packet to its destination; it may have been rewritten
    Relay(Packet),
    /// Send this packet to the client instead of relaying
    Reply(Packet),
}

impl Received {
    pub fn into_packet(self) -> Packet {
        match self {
            Received::Relay(pkt) | Received::Reply(pkt) => pkt,
        }
    }
}

/// Gateway-wide values handed to plugins at startup
#[derive(Debug, Clone, Default)]
pub struct StartupContext {
    pub api_url: String,
}

/// A pipeline unit.
///
/// Every hook has a no-op default, so a plugin only implements what it
/// needs. A plugin disabled for the session's connection still receives
/// its hooks and is expected to check [`SessionContext::plugin_enabled`].
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn on_startup(&self, _startup: &StartupContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// May mutate the session before it opens
    async fn on_connect(&self, _ctx: &mut SessionContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Rewrite a packet before the receive hooks see it; `None` keeps it
    async fn transform(
        &self,
        _ctx: &SessionContext,
        _pkt: &Packet,
    ) -> Result<Option<Packet>, PluginError> {
        Ok(None)
    }

    async fn on_receive(
        &self,
        _ctx: &SessionContext,
        _pkt: &Packet,
    ) -> Result<Option<PluginResponse>, PluginError> {
        Ok(None)
    }

    async fn on_disconnect(
        &self,
        _ctx: &SessionContext,
        _err: Option<&str>,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_shutdown(&self) {}
}

/// Ordered set of registered plugins
pub struct PluginRegistry {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
        }
    }

    /// Append a plugin; execution follows registration order
    pub async fn register(&self, plugin: Arc<dyn Plugin>) {
        debug!("registering plugin: {}", plugin.name());
        self.plugins.write().await.push(plugin);
    }

    pub async fn len(&self) -> usize {
        self.plugins.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plugins.read().await.is_empty()
    }

    pub async fn names(&self) -> Vec<String> {
        self.plugins
            .read()
            .await
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.read().await.clone()
    }

    /// Start every plugin, stopping at the first failure
    pub async fn startup(&self, startup: &StartupContext) -> Result<(), PipelineError> {
        for plugin in self.snapshot().await {
            plugin
                .on_startup(startup)
                .await
                .map_err(|source| PipelineError {
                    plugin: plugin.name().to_string(),
                    source,
                })?;
            debug!("plugin {} started", plugin.name());
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        for plugin in self.snapshot().await {
            plugin.on_shutdown().await;
            debug!("plugin {} shut down", plugin.name());
        }
    }

    /// Pair each plugin with its configuration for `connection_id`
    pub async fn resolve(
        &self,
        source: &dyn PluginConfigSource,
        connection_id: &str,
    ) -> Pipeline {
        let mut units = Vec::new();
        for plugin in self.snapshot().await {
            let config = source
                .find(plugin.name(), connection_id)
                .await
                .map(|c| PluginConnectionConfig::new(c.enabled, c.config))
                .unwrap_or_default();
            units.push(PipelineUnit { plugin, config });
        }
        Pipeline { units }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct PipelineUnit {
    plugin: Arc<dyn Plugin>,
    config: PluginConnectionConfig,
}

/// The plugins of one session, each with the config for its connection
pub struct Pipeline {
    units: Vec<PipelineUnit>,
}

impl Pipeline {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn is_enabled(&self, plugin: &str) -> bool {
        self.units
            .iter()
            .any(|u| u.plugin.name() == plugin && u.config.enabled)
    }

    pub async fn on_connect(&self, ctx: &mut SessionContext) -> Result<(), PipelineError> {
        for unit in &self.units {
            ctx.plugin_config = Some(unit.config.clone());
            let result = unit.plugin.on_connect(ctx).await;
            ctx.plugin_config = None;
            if let Err(source) = result {
                warn!(
                    "session {} rejected on connect by {}: {}",
                    ctx.sid,
                    unit.plugin.name(),
                    source
                );
                return Err(PipelineError {
                    plugin: unit.plugin.name().to_string(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Run the transform and receive hooks for one packet.
    ///
    /// Transforms run first, in order, each on the previous output. The
    /// receive hooks then see the final packet. The first plugin that
    /// responds ends evaluation: its lifetime, if any, replaces the
    /// session's, and its packet, if any, is sent to the client instead.
    pub async fn on_receive(
        &self,
        ctx: &mut SessionContext,
        mut pkt: Packet,
    ) -> Result<Received, PipelineError> {
        for unit in &self.units {
            ctx.plugin_config = Some(unit.config.clone());
            let result = unit.plugin.transform(ctx, &pkt).await;
            ctx.plugin_config = None;
            match result {
                Ok(None) => {}
                Ok(Some(rewritten)) => {
                    debug!(
                        "session {} packet {} rewritten by {}",
                        ctx.sid,
                        pkt.packet_type,
                        unit.plugin.name()
                    );
                    pkt = rewritten;
                }
                Err(source) => return Err(self.rejected(ctx, &pkt, unit, source)),
            }
        }

        for unit in &self.units {
            ctx.plugin_config = Some(unit.config.clone());
            let result = unit.plugin.on_receive(ctx, &pkt).await;
            ctx.plugin_config = None;
            match result {
                Ok(None) => {}
                Ok(Some(response)) => {
                    debug!(
                        "session {} packet {} answered by {}",
                        ctx.sid,
                        pkt.packet_type,
                        unit.plugin.name()
                    );
                    if let Some(lifetime) = response.lifetime {
                        ctx.lifetime = lifetime;
                    }
                    return Ok(match response.client_packet {
                        Some(reply) => Received::Reply(reply),
                        None => Received::Relay(pkt),
                    });
                }
                Err(source) => return Err(self.rejected(ctx, &pkt, unit, source)),
            }
        }
        Ok(Received::Relay(pkt))
    }

    fn rejected(
        &self,
        ctx: &SessionContext,
        pkt: &Packet,
        unit: &PipelineUnit,
        source: PluginError,
    ) -> PipelineError {
        warn!(
            "session {} packet {} rejected by {}: {}",
            ctx.sid,
            pkt.packet_type,
            unit.plugin.name(),
            source
        );
        PipelineError {
            plugin: unit.plugin.name().to_string(),
            source,
        }
    }

    /// Best effort: every plugin runs, failures are logged
    pub async fn on_disconnect(&self, ctx: &mut SessionContext, err: Option<&str>) {
        for unit in &self.units {
            ctx.plugin_config = Some(unit.config.clone());
            if let Err(e) = unit.plugin.on_disconnect(ctx, err).await {
                warn!(
                    "session {} plugin {} failed on disconnect: {}",
                    ctx.sid,
                    unit.plugin.name(),
                    e
                );
            }
        }
        ctx.plugin_config = None;
    }
}
