//! Audit — records every session transcript in the write-ahead log

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::{ClientOrigin, SessionContext};
use crate::packet::Packet;
use crate::plugin::{Plugin, PluginError, PluginResponse, StartupContext};
use crate::wal::{WalError, WalHeader, WalStore};

pub struct AuditPlugin {
    wal: Arc<WalStore>,
}

impl AuditPlugin {
    pub fn new(wal: Arc<WalStore>) -> Self {
        Self { wal }
    }

    pub fn store(&self) -> &Arc<WalStore> {
        &self.wal
    }
}

pub(super) fn internal(e: WalError) -> PluginError {
    PluginError::Internal(e.to_string())
}

#[async_trait]
impl Plugin for AuditPlugin {
    fn name(&self) -> &str {
        super::AUDIT
    }

    async fn on_startup(&self, _startup: &StartupContext) -> Result<(), PluginError> {
        let recovered = self.wal.recover_orphans().await.map_err(internal)?;
        if !recovered.is_empty() {
            info!("audit recovered {} session logs", recovered.len());
        }
        Ok(())
    }

    async fn on_connect(&self, ctx: &mut SessionContext) -> Result<(), PluginError> {
        if !ctx.plugin_enabled() || ctx.client_origin == ClientOrigin::Agent {
            return Ok(());
        }
        let path = self
            .wal
            .open(WalHeader::from_context(ctx))
            .await
            .map_err(internal)?;
        debug!("session {} audit log at {}", ctx.sid, path.display());
        Ok(())
    }

    async fn on_receive(
        &self,
        ctx: &SessionContext,
        pkt: &Packet,
    ) -> Result<Option<PluginResponse>, PluginError> {
        if !ctx.plugin_enabled() {
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
        match self.wal.close(&ctx.sid, err).await {
            Ok(report) => {
                debug!(
                    "session {} audit closed ({} events)",
                    ctx.sid, report.event_count
                );
                Ok(())
            }
            // a concurrent disconnect already closed it
            Err(WalError::NotFound(_)) => Ok(()),
            Err(e) => Err(internal(e)),
        }
    }
}
