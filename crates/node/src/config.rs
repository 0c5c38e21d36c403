//! Configuration management for a Wolpertinger node.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/wolpertinger/config.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wolpertinger_protocol::ClusterSecret;

use crate::components::auth::{AuthPolicy, HandshakeCredentials};
use crate::connection::{ConnectionSettings, DEFAULT_MAX_PENDING};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("node name must not be empty")]
    EmptyNodeName,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("call_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidCallTimeout(u64),

    #[error("heartbeat_interval_secs must be between 1 and 86400, got {0}")]
    InvalidHeartbeatInterval(u64),

    #[error(
        "heartbeat_timeout_secs must be between 1 and heartbeat_interval_secs ({interval}), \
         got {timeout}"
    )]
    InvalidHeartbeatTimeout { timeout: u64, interval: u64 },

    #[error("idle_timeout_secs must be between 1 and 86400, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("max_pending_calls must be between 1 and 1000000, got {0}")]
    InvalidMaxPending(usize),

    #[error("hashing workers must be between 1 and 64, got {0}")]
    InvalidWorkers(usize),

    #[error("cluster_secret must be non-empty hex: {0}")]
    InvalidClusterSecret(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for a Wolpertinger node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Identity and logging.
    pub node: NodeConfig,

    /// Call and heartbeat tuning.
    pub connection: ConnectionConfig,

    /// Admission and credentials.
    pub security: SecurityConfig,

    /// Background hashing.
    pub hashing: HashingConfig,
}

/// General node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Peer id this node is reachable under.
    pub name: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Call and heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Seconds a blocking call waits for its reply.
    pub call_timeout_secs: u64,

    /// Seconds between heartbeats on an established connection.
    pub heartbeat_interval_secs: u64,

    /// Seconds a heartbeat waits before it is logged as missed.
    pub heartbeat_timeout_secs: u64,

    /// Maximum simultaneously pending calls per connection.
    pub max_pending_calls: usize,

    /// Seconds an unauthenticated, unused connection is kept before it is pruned.
    pub idle_timeout_secs: u64,
}

/// Security settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Accept `EstablishConnection` from peers this node never contacted.
    pub accept_unsolicited: bool,

    /// Peers accepted even when unsolicited.
    pub allowed_peers: Vec<String>,

    /// Hex-encoded cluster secret shared by all cluster members.
    pub cluster_secret: Option<String>,

    /// Password required for user-level trust.
    pub admin_password: Option<String>,

    /// During an outbound handshake, make the peer prove cluster membership too.
    pub require_peer_cluster_auth: bool,
}

/// Hashing worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HashingConfig {
    /// Number of worker threads.
    pub workers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            heartbeat_interval_secs: 60,
            heartbeat_timeout_secs: 10,
            max_pending_calls: DEFAULT_MAX_PENDING,
            idle_timeout_secs: 120,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            accept_unsolicited: false,
            allowed_peers: Vec::new(),
            cluster_secret: None,
            admin_password: None,
            require_peer_cluster_auth: true,
        }
    }
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

impl ConnectionConfig {
    /// Per-connection call settings.
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            max_pending: self.max_pending_calls,
        }
    }

    /// Interval between heartbeats.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Time a heartbeat waits for its answer.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Time an idle unauthenticated connection is kept.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl SecurityConfig {
    fn parsed_secret(&self) -> Result<Option<ClusterSecret>, ConfigError> {
        self.cluster_secret
            .as_deref()
            .map(|secret| {
                ClusterSecret::from_hex(secret)
                    .map_err(|e| ConfigError::InvalidClusterSecret(e.to_string()))
            })
            .transpose()
    }

    /// Admission rules and credentials for the `Authentication` component.
    pub fn auth_policy(&self) -> Result<AuthPolicy, ConfigError> {
        Ok(AuthPolicy {
            accept_unsolicited: self.accept_unsolicited,
            allowed_peers: self.allowed_peers.iter().cloned().collect::<HashSet<_>>(),
            cluster_secret: self.parsed_secret()?,
            admin_password: self.admin_password.clone(),
        })
    }

    /// Credentials this node presents when it initiates a handshake.
    pub fn handshake_credentials(&self) -> Result<HandshakeCredentials, ConfigError> {
        Ok(HandshakeCredentials {
            cluster_secret: self.parsed_secret()?,
            password: self.admin_password.clone(),
            verify_peer: self.require_peer_cluster_auth,
        })
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wolpertinger")
        .join("config.toml")
}

/// Peer id used when none is configured.
fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "wolpertinger".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WOLPERTINGER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - WOLPERTINGER_CLUSTER_SECRET: Override the cluster secret
    /// - WOLPERTINGER_ADMIN_PASSWORD: Override the admin password
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("WOLPERTINGER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.node.log_level = level;
            }
        }

        if let Ok(secret) = std::env::var("WOLPERTINGER_CLUSTER_SECRET") {
            if !secret.is_empty() {
                tracing::info!("Overriding cluster_secret from environment");
                self.security.cluster_secret = Some(secret);
            }
        }

        if let Ok(password) = std::env::var("WOLPERTINGER_ADMIN_PASSWORD") {
            if !password.is_empty() {
                tracing::info!("Overriding admin_password from environment");
                self.security.admin_password = Some(password);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.trim().is_empty() {
            return Err(ConfigError::EmptyNodeName);
        }

        let level = self.node.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.node.log_level.clone()));
        }

        let connection = &self.connection;
        if !(1..=3600).contains(&connection.call_timeout_secs) {
            return Err(ConfigError::InvalidCallTimeout(connection.call_timeout_secs));
        }

        if !(1..=86_400).contains(&connection.heartbeat_interval_secs) {
            return Err(ConfigError::InvalidHeartbeatInterval(
                connection.heartbeat_interval_secs,
            ));
        }

        if connection.heartbeat_timeout_secs == 0
            || connection.heartbeat_timeout_secs > connection.heartbeat_interval_secs
        {
            return Err(ConfigError::InvalidHeartbeatTimeout {
                timeout: connection.heartbeat_timeout_secs,
                interval: connection.heartbeat_interval_secs,
            });
        }

        if !(1..=1_000_000).contains(&connection.max_pending_calls) {
            return Err(ConfigError::InvalidMaxPending(connection.max_pending_calls));
        }

        if !(1..=86_400).contains(&connection.idle_timeout_secs) {
            return Err(ConfigError::InvalidIdleTimeout(connection.idle_timeout_secs));
        }

        if !(1..=64).contains(&self.hashing.workers) {
            return Err(ConfigError::InvalidWorkers(self.hashing.workers));
        }

        self.security.parsed_secret()?;

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const SECRET: &str = "00112233445566778899aabbccddeeff";

    fn clear_env() {
        std::env::remove_var("WOLPERTINGER_LOG_LEVEL");
        std::env::remove_var("WOLPERTINGER_CLUSTER_SECRET");
        std::env::remove_var("WOLPERTINGER_ADMIN_PASSWORD");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.node.log_level, "info");
        assert!(!config.node.name.is_empty());
        assert_eq!(config.connection.call_timeout_secs, 30);
        assert_eq!(config.connection.heartbeat_interval_secs, 60);
        assert_eq!(config.connection.heartbeat_timeout_secs, 10);
        assert_eq!(config.connection.max_pending_calls, 8192);
        assert!(!config.security.accept_unsolicited);
        assert!(config.security.allowed_peers.is_empty());
        assert!(config.security.cluster_secret.is_none());
        assert!(config.security.require_peer_cluster_auth);
        assert_eq!(config.hashing.workers, 2);
    }

    #[test]
    fn test_default_node_config() {
        let config = NodeConfig::default();
        assert!(!config.name.trim().is_empty());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[node]
log_level = "debug"

[connection]
call_timeout_secs = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.node.log_level, "debug");
        assert_eq!(config.connection.call_timeout_secs, 5);
        assert_eq!(config.connection.heartbeat_interval_secs, 60);
        assert_eq!(config.hashing, HashingConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[node]
name = "alpha@cluster"
log_level = "trace"

[connection]
call_timeout_secs = 12
heartbeat_interval_secs = 120
heartbeat_timeout_secs = 20
max_pending_calls = 64
idle_timeout_secs = 30

[security]
accept_unsolicited = true
allowed_peers = ["beta@cluster", "gamma@cluster"]
cluster_secret = "00112233445566778899aabbccddeeff"
admin_password = "hunter2"
require_peer_cluster_auth = false

[hashing]
workers = 4
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.node.name, "alpha@cluster");
        assert_eq!(config.node.log_level, "trace");
        assert_eq!(config.connection.call_timeout_secs, 12);
        assert_eq!(config.connection.heartbeat_interval_secs, 120);
        assert_eq!(config.connection.heartbeat_timeout_secs, 20);
        assert_eq!(config.connection.max_pending_calls, 64);
        assert_eq!(config.connection.idle_timeout(), Duration::from_secs(30));
        assert!(config.security.accept_unsolicited);
        assert_eq!(config.security.allowed_peers.len(), 2);
        assert_eq!(config.security.cluster_secret.as_deref(), Some(SECRET));
        assert_eq!(config.security.admin_password.as_deref(), Some("hunter2"));
        assert!(!config.security.require_peer_cluster_auth);
        assert_eq!(config.hashing.workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[node
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[hashing]
workers = "many"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.node.log_level = "warn".to_string();
        original.security.allowed_peers = vec!["beta".to_string()];
        original.security.cluster_secret = Some(SECRET.to_string());
        original.hashing.workers = 8;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[node]"));
        assert!(toml.contains("[connection]"));
        assert!(toml.contains("[security]"));
        assert!(toml.contains("[hashing]"));

        let loaded = Config::from_toml(&toml).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.node.name = "saved".to_string();
        original.connection.max_pending_calls = 16;

        original.save(&config_path).unwrap();
        assert!(config_path.exists());
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("wolpertinger"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_connection_settings_conversion() {
        let config = ConnectionConfig {
            call_timeout_secs: 3,
            max_pending_calls: 9,
            ..ConnectionConfig::default()
        };
        let settings = config.settings();
        assert_eq!(settings.call_timeout, Duration::from_secs(3));
        assert_eq!(settings.max_pending, 9);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(10));
        assert_eq!(config.idle_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_auth_policy_and_credentials() {
        let security = SecurityConfig {
            allowed_peers: vec!["beta".to_string()],
            cluster_secret: Some(SECRET.to_uppercase()),
            admin_password: Some("pw".to_string()),
            ..SecurityConfig::default()
        };

        let policy = security.auth_policy().unwrap();
        assert!(policy.admits("beta", false));
        assert!(!policy.admits("gamma", false));
        assert_eq!(policy.cluster_secret.unwrap().as_hex(), SECRET);

        let credentials = security.handshake_credentials().unwrap();
        assert!(credentials.verify_peer);
        assert_eq!(credentials.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = Config::default();
        config.connection.call_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidCallTimeout(0)));

        let mut config = Config::default();
        config.connection.heartbeat_interval_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidHeartbeatInterval(0)));

        let mut config = Config::default();
        config.connection.heartbeat_timeout_secs = 61;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidHeartbeatTimeout {
                timeout: 61,
                interval: 60
            })
        );

        let mut config = Config::default();
        config.connection.max_pending_calls = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxPending(0)));

        let mut config = Config::default();
        config.connection.idle_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidIdleTimeout(0)));

        let mut config = Config::default();
        config.hashing.workers = 65;
        assert_eq!(config.validate(), Err(ConfigError::InvalidWorkers(65)));
    }

    #[test]
    fn test_validate_node_name_and_log_level() {
        let mut config = Config::default();
        config.node.name = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyNodeName));

        let mut config = Config::default();
        config.node.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.node.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_cluster_secret() {
        let mut config = Config::default();
        config.security.cluster_secret = Some("not-hex".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidClusterSecret(_))
        ));
        assert!(config.security.auth_policy().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("WOLPERTINGER_LOG_LEVEL", "debug");
        std::env::set_var("WOLPERTINGER_CLUSTER_SECRET", SECRET);
        std::env::set_var("WOLPERTINGER_ADMIN_PASSWORD", "from-env");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.node.log_level, "debug");
        assert_eq!(config.security.cluster_secret.as_deref(), Some(SECRET));
        assert_eq!(config.security.admin_password.as_deref(), Some("from-env"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("WOLPERTINGER_LOG_LEVEL", "");
        std::env::set_var("WOLPERTINGER_ADMIN_PASSWORD", "");

        let mut config = Config::default();
        config.security.admin_password = Some("file".to_string());
        config.apply_env_overrides();

        assert_eq!(config.node.log_level, "info");
        assert_eq!(config.security.admin_password.as_deref(), Some("file"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config, Config::default());
    }
}
