//! Per-session state threaded through the plugin pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which kind of peer opened the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientOrigin {
    Agent,
    Client,
    ClientProxyManager,
}

impl ClientOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientOrigin::Agent => "agent",
            ClientOrigin::Client => "client",
            ClientOrigin::ClientProxyManager => "client-proxy-manager",
        }
    }
}

impl fmt::Display for ClientOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientOrigin {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(ClientOrigin::Agent),
            "client" => Ok(ClientOrigin::Client),
            "client-proxy-manager" => Ok(ClientOrigin::ClientProxyManager),
            other => Err(ContextError::UnknownOrigin(other.to_string())),
        }
    }
}

/// How an agent binds to the session router
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    #[default]
    Standard,
    MultiConnection,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("missing required session attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("unknown client origin: {0}")]
    UnknownOrigin(String),
}

/// Why a lifetime ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeEnd {
    Cancelled,
    DeadlineExceeded,
}

/// A cancellable session lifetime with an optional deadline.
///
/// Shortening a lifetime produces a child: cancelling the parent still
/// ends it, and its deadline is never later than the parent's.
#[derive(Debug, Clone)]
pub struct Lifetime {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifetime {
    pub fn new() -> Self {
        Self::from_token(CancellationToken::new())
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Child lifetime ending at most `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolve when the lifetime is cancelled or its deadline passes
    pub async fn done(&self) -> LifetimeEnd {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => LifetimeEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => LifetimeEnd::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                LifetimeEnd::Cancelled
            }
        }
    }
}

/// Per-connection settings of one plugin, resolved at connect time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConnectionConfig {
    pub enabled: bool,
    pub config: Vec<String>,
}

impl PluginConnectionConfig {
    /// Build a config with entries de-duplicated, keeping first occurrence order
    pub fn new(enabled: bool, config: impl IntoIterator<Item = String>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let config = config
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty() && seen.insert(c.clone()))
            .collect();
        Self { enabled, config }
    }
}

/// State of a single session, created at connect and mutated by plugins
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub sid: String,
    pub org_id: String,

    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
    pub user_groups: Vec<String>,

    pub connection_id: String,
    pub connection_name: String,
    pub connection_type: String,
    pub connection_subtype: String,
    pub connection_command: Vec<String>,
    pub connection_secret: HashMap<String, String>,

    pub agent_id: String,
    pub agent_name: String,
    pub agent_mode: AgentMode,

    pub client_origin: ClientOrigin,
    pub client_verb: String,

    /// Config of the plugin currently being invoked
    pub plugin_config: Option<PluginConnectionConfig>,

    /// Free-form values plugins pass to each other
    pub params: HashMap<String, Value>,

    pub lifetime: Lifetime,
    pub started_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(sid: impl Into<String>, origin: ClientOrigin) -> Self {
        Self {
            sid: sid.into(),
            org_id: String::new(),
            user_id: String::new(),
            user_name: String::new(),
            user_email: String::new(),
            user_groups: Vec::new(),
            connection_id: String::new(),
            connection_name: String::new(),
            connection_type: String::new(),
            connection_subtype: String::new(),
            connection_command: Vec::new(),
            connection_secret: HashMap::new(),
            agent_id: String::new(),
            agent_name: String::new(),
            agent_mode: AgentMode::default(),
            client_origin: origin,
            client_verb: String::new(),
            plugin_config: None,
            params: HashMap::new(),
            lifetime: Lifetime::new(),
            started_at: Utc::now(),
        }
    }

    /// A session may only open once its connection attributes are known
    pub fn validate(&self) -> Result<(), ContextError> {
        let required = [
            ("sid", &self.sid),
            ("org_id", &self.org_id),
            ("connection_id", &self.connection_id),
            ("connection_name", &self.connection_name),
            ("connection_type", &self.connection_type),
            ("agent_id", &self.agent_id),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ContextError::MissingAttribute(name));
            }
        }
        Ok(())
    }

    pub fn plugin_enabled(&self) -> bool {
        self.plugin_config.as_ref().is_some_and(|c| c.enabled)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}
