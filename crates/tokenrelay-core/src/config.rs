//! Configuration resolution for tokenrelay.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/tokenrelay/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files may be partial; each layer is merged key by key over the previous.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Complete tokenrelay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub session: SessionConfig,
    pub reconnect: ReconnectConfig,
}

/// Inbound listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Upgrade path accepted for relay connections.
    pub path: String,
    /// When set, only these tokens are accepted.
    pub allowed_tokens: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8089".to_string(),
            path: "/ws".to_string(),
            allowed_tokens: None,
        }
    }
}

/// Agent dial target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8888/ws".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

/// Per-session endpoint tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Outbound queue capacity per endpoint.
    pub queue_capacity: usize,
    pub keepalive_interval_secs: u64,
    /// Maximum silence tolerated on a read before the side is considered dead.
    pub read_deadline_secs: u64,
    /// Delay between the `exit` notification and teardown.
    pub exit_grace_millis: u64,
    /// Upper bound on flushing and closing a transport.
    pub close_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            keepalive_interval_secs: 30,
            read_deadline_secs: 60,
            exit_grace_millis: 1000,
            close_timeout_secs: 5,
        }
    }
}

/// Agent reconnection budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_interval_millis: u64,
    pub max_retries: u32,
    pub max_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_interval_millis: 1000,
            max_retries: 3,
            max_delay_secs: 60,
        }
    }
}

impl SessionConfig {
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub const fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub const fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_millis)
    }

    pub const fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

impl Config {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.session.queue_capacity == 0 {
            return Err(Error::Config("session.queue_capacity must be > 0".into()));
        }
        if self.session.keepalive_interval_secs == 0 || self.session.read_deadline_secs == 0 {
            return Err(Error::Config(
                "session keepalive interval and read deadline must be > 0".into(),
            ));
        }
        if self.session.read_deadline_secs <= self.session.keepalive_interval_secs {
            return Err(Error::Config(format!(
                "session.read_deadline_secs ({}) must exceed keepalive_interval_secs ({})",
                self.session.read_deadline_secs, self.session.keepalive_interval_secs
            )));
        }
        if !(self.agent.url.starts_with("ws://") || self.agent.url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "agent.url must use ws:// or wss://, got {}",
                self.agent.url
            )));
        }
        if !self.server.path.starts_with('/') {
            return Err(Error::Config(format!(
                "server.path must start with '/', got {}",
                self.server.path
            )));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_values(&mut merged, load_config_value(&global_path)?);
    }

    if let Some(path) = explicit {
        merge_values(&mut merged, load_config_value(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tokenrelay").join("settings.json"))
}

fn load_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Recursively overlay `overlay` onto `base`. Objects merge per key, any
/// other value replaces.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `TOKENRELAY_*` overrides. `lookup` is `std::env::var` in production.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("TOKENRELAY_LISTEN_ADDR") {
        config.server.listen_addr = val;
    }
    if let Some(val) = lookup("TOKENRELAY_PATH") {
        config.server.path = val;
    }
    if let Some(val) = lookup("TOKENRELAY_AGENT_URL") {
        config.agent.url = val;
    }
    if let Some(n) = lookup("TOKENRELAY_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
        config.session.queue_capacity = n;
    }
    if let Some(n) = lookup("TOKENRELAY_KEEPALIVE_SECS").and_then(|v| v.parse().ok()) {
        config.session.keepalive_interval_secs = n;
    }
    if let Some(n) = lookup("TOKENRELAY_READ_DEADLINE_SECS").and_then(|v| v.parse().ok()) {
        config.session.read_deadline_secs = n;
    }
    if let Some(n) = lookup("TOKENRELAY_MAX_RETRIES").and_then(|v| v.parse().ok()) {
        config.reconnect.max_retries = n;
    }
    if let Some(n) = lookup("TOKENRELAY_BASE_INTERVAL_MILLIS").and_then(|v| v.parse().ok()) {
        config.reconnect.base_interval_millis = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_relay_constants() {
        let config = Config::default();
        assert_eq!(config.session.queue_capacity, 1000);
        assert_eq!(config.session.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.reconnect.base_interval_millis, 1000);
        assert_eq!(config.server.path, "/ws");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"agent": {{"url": "wss://agent.example.com/api/ws/stream"}}, "reconnect": {{"max_retries": 5}}}}"#
        )
        .unwrap();

        let mut merged = serde_json::to_value(Config::default()).unwrap();
        merge_values(&mut merged, load_config_value(file.path()).unwrap());
        let config: Config = serde_json::from_value(merged).unwrap();

        assert_eq!(config.agent.url, "wss://agent.example.com/api/ws/stream");
        assert_eq!(config.agent.connect_timeout_secs, 10);
        assert_eq!(config.reconnect.max_retries, 5);
        assert_eq!(config.reconnect.base_interval_millis, 1000);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn non_object_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2, 3]").unwrap();
        assert!(matches!(
            load_config_value(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TOKENRELAY_AGENT_URL", "ws://10.0.0.2:8888/ws"),
            ("TOKENRELAY_MAX_RETRIES", "7"),
            ("TOKENRELAY_QUEUE_CAPACITY", "lots"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.agent.url, "ws://10.0.0.2:8888/ws");
        assert_eq!(config.reconnect.max_retries, 7);
        assert_eq!(config.session.queue_capacity, 1000);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.session.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.agent.url = "http://agent".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.read_deadline_secs = config.session.keepalive_interval_secs;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.path = "ws".into();
        assert!(config.validate().is_err());
    }
}
