//! Gateway configuration loaded from `~/.relaygate/config.toml`

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::context::AgentMode;
use crate::dispatcher::DispatcherSettings;
use crate::plugin::StaticPluginConfig;
use crate::plugins;
use crate::wal::{DEFAULT_MAX_DIRECTION_BYTES, WalSettings};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub wal: WalConfig,
    pub dispatcher: DispatcherConfig,
    pub storage: StorageConfig,
    pub index: IndexConfig,
    pub identities: Vec<IdentityConfig>,
    pub connections: Vec<ConnectionConfig>,
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub control_addr: String,
    /// Public URL used in review links sent to clients
    pub api_url: String,
    /// Bearer token for the control API; empty disables the check
    pub control_token: String,
    pub handshake_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8010".to_string(),
            control_addr: "127.0.0.1:8009".to_string(),
            api_url: "http://127.0.0.1:8009".to_string(),
            control_token: String::new(),
            handshake_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub dir: Option<PathBuf>,
    pub max_input_bytes: usize,
    pub max_output_bytes: usize,
    pub retain_committed: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_input_bytes: DEFAULT_MAX_DIRECTION_BYTES,
            max_output_bytes: DEFAULT_MAX_DIRECTION_BYTES,
            retain_committed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub handoff_timeout_ms: u64,
    pub response_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let defaults = DispatcherSettings::default();
        Self {
            handoff_timeout_ms: defaults.handoff_timeout.as_millis() as u64,
            response_timeout_secs: defaults.response_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for committed session transcripts
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Root of the per-org search indexes and the indexer's session logs
    pub dir: Option<PathBuf>,
    /// Bytes per direction indexed for one session
    pub max_bytes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_bytes: DEFAULT_MAX_DIRECTION_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    #[default]
    User,
    Agent,
}

/// A bearer token and who it authenticates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub token: String,
    #[serde(default)]
    pub kind: IdentityKind,
    pub org_id: String,
    /// User id, or agent id for agent identities
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub agent_mode: AgentMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    /// Defaults to `name`
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub connection_type: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub command: Vec<String>,
    pub agent_id: String,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

impl ConnectionConfig {
    pub fn connection_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub connections: Vec<PluginConnectionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConnectionEntry {
    /// Connection name
    pub connection: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Expand `${VAR}` references from the environment; unset variables expand to ""
pub fn expand_env(text: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| anyhow!("Invalid regex: {}", e))?;
    let expanded = re.replace_all(text, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match std::env::var(key) {
            Ok(value) => value,
            Err(_) => {
                warn!("Environment variable '{}' is not set", key);
                String::new()
            }
        }
    });
    Ok(expanded.into_owned())
}

impl GatewayConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".relaygate").join("config.toml"))
    }

    /// Read, expand and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config = Self::parse(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.expand_secrets()?;
        config.validate()?;
        debug!(
            "Loaded config from {} ({} connections, {} identities)",
            path.display(),
            config.connections.len(),
            config.identities.len()
        );
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn expand_secrets(&mut self) -> Result<()> {
        self.server.control_token = expand_env(&self.server.control_token)?;
        for identity in &mut self.identities {
            identity.token = expand_env(&identity.token)?;
        }
        for conn in &mut self.connections {
            for value in conn.secrets.values_mut() {
                *value = expand_env(value)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.wal.max_input_bytes == 0 || self.wal.max_output_bytes == 0 {
            bail!("wal size caps must be greater than zero");
        }
        if self.index.max_bytes == 0 {
            bail!("index size cap must be greater than zero");
        }
        if self.dispatcher.handoff_timeout_ms == 0 || self.dispatcher.response_timeout_secs == 0 {
            bail!("dispatcher timeouts must be greater than zero");
        }

        let mut tokens = HashSet::new();
        for identity in &self.identities {
            if identity.token.trim().is_empty() {
                bail!("identity {} has an empty token", identity.id);
            }
            if !tokens.insert(identity.token.as_str()) {
                bail!("identity {} reuses a token of another identity", identity.id);
            }
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for conn in &self.connections {
            if !names.insert(conn.name.as_str()) {
                bail!("duplicate connection name: {}", conn.name);
            }
            if !ids.insert(conn.connection_id()) {
                bail!("duplicate connection id: {}", conn.connection_id());
            }
            if conn.agent_id.trim().is_empty() {
                bail!("connection {} has no agent_id", conn.name);
            }
        }

        for plugin in &self.plugins {
            if !plugins::BUILTIN.contains(&plugin.name.as_str()) {
                bail!(
                    "unknown plugin {} (expected one of {})",
                    plugin.name,
                    plugins::BUILTIN.join(", ")
                );
            }
            for entry in &plugin.connections {
                if !names.contains(entry.connection.as_str()) {
                    bail!(
                        "plugin {} refers to unknown connection {}",
                        plugin.name,
                        entry.connection
                    );
                }
            }
        }
        Ok(())
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.name == name)
    }

    pub fn wal_settings(&self) -> WalSettings {
        let defaults = WalSettings::default();
        WalSettings {
            dir: self.wal.dir.clone().unwrap_or(defaults.dir),
            max_input_bytes: self.wal.max_input_bytes,
            max_output_bytes: self.wal.max_output_bytes,
            retain_committed: self.wal.retain_committed,
        }
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.storage.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("relaygate")
                .join("transcripts")
        })
    }

    pub fn index_dir(&self) -> PathBuf {
        self.index.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("relaygate")
                .join("indexes")
        })
    }

    /// Where the per-org search indexes live
    pub fn index_orgs_dir(&self) -> PathBuf {
        self.index_dir().join("orgs")
    }

    /// Session logs kept by the indexer until each session is indexed
    pub fn index_wal_settings(&self) -> WalSettings {
        WalSettings {
            dir: self.index_dir().join("wal"),
            max_input_bytes: self.index.max_bytes,
            max_output_bytes: self.index.max_bytes,
            retain_committed: false,
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            handoff_timeout: Duration::from_millis(self.dispatcher.handoff_timeout_ms),
            response_timeout: Duration::from_secs(self.dispatcher.response_timeout_secs),
        }
    }

    /// Plugin lookup keyed by connection id
    pub fn plugin_source(&self) -> StaticPluginConfig {
        let source = StaticPluginConfig::new();
        for plugin in &self.plugins {
            for entry in &plugin.connections {
                let Some(conn) = self.connection(&entry.connection) else {
                    continue;
                };
                source.insert(
                    &plugin.name,
                    conn.connection_id(),
                    entry.enabled,
                    entry.config.clone(),
                );
            }
        }
        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginConfigSource;

    const SAMPLE: &str = r#"
[server]
listen_addr = "0.0.0.0:9010"
control_token = "ctl"

[wal]
max_output_bytes = 2048

[[identities]]
token = "user-token"
org_id = "org"
id = "u1"
email = "ada@example.com"
groups = ["dba"]

[[identities]]
token = "agent-token"
kind = "agent"
org_id = "org"
id = "agent-1"
agent_mode = "multi-connection"

[[connections]]
name = "pg-prod"
type = "database"
subtype = "postgres"
agent_id = "agent-1"
secrets = { PGPASSWORD = "secret" }

[[plugins]]
name = "review"
[[plugins.connections]]
connection = "pg-prod"
config = ["dba", "dba", " sre "]
"#;

    #[test]
    fn test_parse_sample() {
        let config = GatewayConfig::parse(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:9010");
        assert_eq!(config.server.handshake_timeout_secs, 10);
        assert_eq!(config.wal.max_input_bytes, DEFAULT_MAX_DIRECTION_BYTES);
        assert_eq!(config.wal.max_output_bytes, 2048);
        assert_eq!(config.identities[1].kind, IdentityKind::Agent);
        assert_eq!(config.identities[1].agent_mode, AgentMode::MultiConnection);
        let conn = config.connection("pg-prod").unwrap();
        assert_eq!(conn.connection_id(), "pg-prod");
        assert_eq!(conn.connection_type, "database");
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::parse("").unwrap();
        config.validate().unwrap();
        let dispatcher = config.dispatcher_settings();
        assert_eq!(dispatcher.handoff_timeout, Duration::from_millis(500));
        assert_eq!(dispatcher.response_timeout, Duration::from_secs(10));
        assert_eq!(config.index.max_bytes, DEFAULT_MAX_DIRECTION_BYTES);
    }

    #[test]
    fn test_index_layout() {
        let config = GatewayConfig::parse(
            r#"
[index]
dir = "/var/lib/relaygate/index"
max_bytes = 4096
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.index_orgs_dir(),
            PathBuf::from("/var/lib/relaygate/index/orgs")
        );
        let wal = config.index_wal_settings();
        assert_eq!(wal.dir, PathBuf::from("/var/lib/relaygate/index/wal"));
        assert_eq!(wal.max_output_bytes, 4096);
        assert!(!wal.retain_committed);

        let zero = GatewayConfig::parse("[index]\nmax_bytes = 0\n").unwrap();
        assert!(zero.validate().is_err());
    }

    #[tokio::test]
    async fn test_plugin_source_dedups_config() {
        let config = GatewayConfig::parse(SAMPLE).unwrap();
        let source = config.plugin_source();
        let found = source.find("review", "pg-prod").await.unwrap();
        assert!(found.enabled);
        assert_eq!(found.config, vec!["dba", "sre"]);
        assert!(source.find("audit", "pg-prod").await.is_none());
    }

    #[test]
    fn test_rejects_duplicate_connection() {
        let raw = r#"
[[connections]]
name = "bash"
type = "command-line"
agent_id = "a"

[[connections]]
name = "bash"
type = "command-line"
agent_id = "a"
"#;
        let err = GatewayConfig::parse(raw).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("duplicate connection"));
    }

    #[test]
    fn test_rejects_unknown_plugin() {
        let raw = "[[plugins]]\nname = \"slack\"\n";
        let err = GatewayConfig::parse(raw).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("unknown plugin"));
    }

    #[test]
    fn test_rejects_zero_cap_and_empty_token() {
        let zero = GatewayConfig::parse("[wal]\nmax_input_bytes = 0\n").unwrap();
        assert!(zero.validate().is_err());

        let raw = "[[identities]]\ntoken = \"\"\norg_id = \"o\"\nid = \"u\"\n";
        let empty = GatewayConfig::parse(raw).unwrap();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_expand_env() {
        // SAFETY: test-only variable name not read elsewhere
        unsafe { std::env::set_var("RELAYGATE_TEST_TOKEN_X", "s3cret") };
        assert_eq!(
            expand_env("Bearer ${RELAYGATE_TEST_TOKEN_X}").unwrap(),
            "Bearer s3cret"
        );
        assert_eq!(expand_env("${RELAYGATE_UNSET_VAR_12345}").unwrap(), "");
        assert_eq!(expand_env("plain").unwrap(), "plain");
    }

    #[test]
    fn test_load_expands_tokens() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        unsafe { std::env::set_var("RELAYGATE_TEST_CTL_TOKEN", "from-env") };
        std::fs::write(&path, "[server]\ncontrol_token = \"${RELAYGATE_TEST_CTL_TOKEN}\"\n")
            .unwrap();
        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.server.control_token, "from-env");
    }
}
