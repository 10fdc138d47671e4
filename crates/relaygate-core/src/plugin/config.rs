//! Per-connection plugin configuration lookup

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::context::PluginConnectionConfig;

/// Read-only lookup of `{plugin, connection} -> {enabled, config}`.
///
/// Queried for every session at connect time; results are not cached
/// across sessions.
#[async_trait]
pub trait PluginConfigSource: Send + Sync {
    async fn find(&self, plugin: &str, connection_id: &str) -> Option<PluginConnectionConfig>;
}

/// In-memory configuration, filled from the gateway config file
#[derive(Default)]
pub struct StaticPluginConfig {
    entries: RwLock<HashMap<(String, String), PluginConnectionConfig>>,
}

impl StaticPluginConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, plugin: &str, connection_id: &str, enabled: bool, config: Vec<String>) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(
            (plugin.to_string(), connection_id.to_string()),
            PluginConnectionConfig::new(enabled, config),
        );
    }

    pub fn remove(&self, plugin: &str, connection_id: &str) -> bool {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .remove(&(plugin.to_string(), connection_id.to_string()))
            .is_some()
    }
}

#[async_trait]
impl PluginConfigSource for StaticPluginConfig {
    async fn find(&self, plugin: &str, connection_id: &str) -> Option<PluginConnectionConfig> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .get(&(plugin.to_string(), connection_id.to_string()))
            .cloned()
    }
}
