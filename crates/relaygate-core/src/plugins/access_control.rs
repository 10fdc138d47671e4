//! Group-based access control on connect

use async_trait::async_trait;
use tracing::debug;

use crate::context::SessionContext;
use crate::plugin::{Plugin, PluginError};

pub struct AccessControlPlugin;

#[async_trait]
impl Plugin for AccessControlPlugin {
    fn name(&self) -> &str {
        super::ACCESS_CONTROL
    }

    async fn on_connect(&self, ctx: &mut SessionContext) -> Result<(), PluginError> {
        let Some(config) = ctx.plugin_config.as_ref().filter(|c| c.enabled) else {
            return Ok(());
        };
        if ctx.user_groups.iter().any(|g| g == super::ADMIN_GROUP) {
            debug!("session {} access granted to admin {}", ctx.sid, ctx.user_id);
            return Ok(());
        }
        let allowed = ctx
            .user_groups
            .iter()
            .any(|g| config.config.iter().any(|c| c == g));
        if !allowed {
            return Err(PluginError::Rejected(format!(
                "user {} has no access to connection {}",
                ctx.user_email, ctx.connection_name
            )));
        }
        Ok(())
    }
}
