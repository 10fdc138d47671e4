//! Indexer: makes closed sessions searchable
//!
//! Keeps a write-ahead log per session, separate from audit, and indexes
//! the transcript into the org's search index when the session closes.
//! A session-close from the agent carrying a payload marks it as failed.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::{ClientOrigin, SessionContext};
use crate::index::SessionIndex;
use crate::packet::{Component, Packet, types};
use crate::plugin::{Plugin, PluginError, PluginResponse, StartupContext};
use crate::wal::{EventType, WalError, WalHeader, WalSettings, WalStore};

use super::audit::internal;

pub struct IndexerPlugin {
    index: SessionIndex,
    wal: Arc<WalStore>,
}

impl IndexerPlugin {
    /// `settings.dir` holds the indexer's own session logs
    pub fn new(index: SessionIndex, settings: WalSettings) -> Self {
        let wal = Arc::new(WalStore::new(
            WalSettings {
                retain_committed: false,
                ..settings
            },
            Arc::new(index.clone()),
        ));
        Self { index, wal }
    }

    pub fn index(&self) -> &SessionIndex {
        &self.index
    }

    pub fn store(&self) -> &Arc<WalStore> {
        &self.wal
    }

    async fn close(&self, ctx: &SessionContext, err: Option<&str>) -> Result<(), PluginError> {
        match self.wal.close(&ctx.sid, err).await {
            Ok(report) => {
                debug!(
                    "session {} indexed ({} bytes)",
                    ctx.sid, report.event_size
                );
                Ok(())
            }
            Err(WalError::NotFound(_)) => Ok(()),
            Err(e) => Err(internal(e)),
        }
    }
}

#[async_trait]
impl Plugin for IndexerPlugin {
    fn name(&self) -> &str {
        super::INDEXER
    }

    async fn on_startup(&self, _startup: &StartupContext) -> Result<(), PluginError> {
        let recovered = self.wal.recover_orphans().await.map_err(internal)?;
        if !recovered.is_empty() {
            info!("indexer recovered {} session logs", recovered.len());
        }
        Ok(())
    }

    async fn on_connect(&self, ctx: &mut SessionContext) -> Result<(), PluginError> {
        if !ctx.plugin_enabled() || ctx.client_origin == ClientOrigin::Agent {
            return Ok(());
        }
        if ctx.org_id.is_empty() || ctx.sid.is_empty() {
            return Err(PluginError::InvalidArgument(
                "indexer requires org and session ids".to_string(),
            ));
        }
        self.wal
            .open(WalHeader::from_context(ctx))
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn on_receive(
        &self,
        ctx: &SessionContext,
        pkt: &Packet,
    ) -> Result<Option<PluginResponse>, PluginError> {
        if !ctx.plugin_enabled() || !self.wal.is_open(&ctx.sid).await {
            return Ok(None);
        }
        if pkt.component == Component::Agent && pkt.is_type(types::SESSION_CLOSE) {
            let err = (!pkt.payload.is_empty()).then(|| String::from_utf8_lossy(&pkt.payload));
            if let Some(err) = &err {
                self.wal
                    .append(&ctx.sid, EventType::Error, err.as_bytes())
                    .await
                    .map_err(internal)?;
            }
            self.close(ctx, err.as_deref()).await?;
            return Ok(None);
        }
        let Some(event_type) = super::transcript_event(pkt) else {
            return Ok(None);
        };
        self.wal
            .append(&ctx.sid, event_type, &pkt.payload)
            .await
            .map_err(internal)?;
        Ok(None)
    }

    async fn on_disconnect(
        &self,
        ctx: &SessionContext,
        err: Option<&str>,
    ) -> Result<(), PluginError> {
        if ctx.client_origin == ClientOrigin::Agent || !self.wal.is_open(&ctx.sid).await {
            return Ok(());
        }
        self.close(ctx, err).await
    }
}
