//! Server configuration
//!
//! Loaded from an optional TOML file; every field has a default so the
//! server runs with no file at all. Durations are milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hub::{HubSettings, OverflowPolicy};

/// Port the server listens on unless told otherwise
pub const DEFAULT_PORT: u16 = 8765;

/// Default bind address
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Which application protocol the server speaks
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AppMode {
    /// Generic JSON relay: direct, group and broadcast delivery
    #[default]
    Relay,
    /// Two-player matchmaking rooms
    Lobby,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Identifier announced in the welcome message
    pub server_id: Option<String>,
    /// Shared token required during the upgrade, if set
    pub token: Option<String>,
    /// Application protocol
    pub mode: AppMode,
    /// Per-connection outbound queue capacity
    pub queue_capacity: usize,
    /// Behavior when an outbound queue is full
    pub overflow_policy: OverflowPolicy,
    /// Interval between server pings
    pub heartbeat_interval_ms: u64,
    /// Maximum silence from a peer before its session is closed
    pub liveness_timeout_ms: u64,
    /// Time allowed to flush the outbound queue when closing
    pub close_grace_ms: u64,
    /// Time allowed for the WebSocket upgrade
    pub handshake_timeout_ms: u64,
    /// Interval between liveness sweeps
    pub sweep_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            server_id: None,
            token: None,
            mode: AppMode::default(),
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::default(),
            heartbeat_interval_ms: 15_000,
            liveness_timeout_ms: 45_000,
            close_grace_ms: 5_000,
            handshake_timeout_ms: 10_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl HubConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: HubConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("liveness_timeout_ms", self.liveness_timeout_ms),
            ("close_grace_ms", self.close_grace_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.liveness_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "liveness_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.liveness_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if matches!(&self.token, Some(token) if token.is_empty()) {
            return Err(ConfigError::Invalid("token cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    /// Set the authentication token
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_mode(mut self, mode: AppMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Settings for the session hub
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            queue_capacity: self.queue_capacity,
            overflow_policy: self.overflow_policy,
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
            close_grace: self.close_grace(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.socket_addr(), "0.0.0.0:8765");
        assert_eq!(config.mode, AppMode::Relay);
        assert_eq!(config.overflow_policy, OverflowPolicy::Close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default_without_path() {
        let config = HubConfig::load_or_default(None).unwrap();
        assert_eq!(config, HubConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        fs::write(
            &path,
            r#"
port = 9100
mode = "lobby"
queue_capacity = 8
overflow_policy = "drop_oldest"
"#,
        )
        .unwrap();

        let config = HubConfig::load(&path).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.mode, AppMode::Lobby);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        // Untouched fields keep their defaults
        assert_eq!(config.bind, DEFAULT_BIND);
        assert_eq!(config.liveness_timeout_ms, 45_000);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempdir().unwrap();
        let result = HubConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Read(_))));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "port = [[[").unwrap();
        assert!(matches!(HubConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let config = HubConfig {
            queue_capacity: 0,
            ..HubConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_validation_requires_timeout_above_heartbeat() {
        let config = HubConfig {
            heartbeat_interval_ms: 30_000,
            liveness_timeout_ms: 30_000,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_overrides() {
        let config = HubConfig::default()
            .with_port(9000)
            .with_bind("127.0.0.1")
            .with_token(Some("secret".to_string()))
            .with_mode(AppMode::Lobby);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.token, Some("secret".to_string()));
        assert_eq!(config.mode, AppMode::Lobby);
    }

    #[test]
    fn test_hub_settings_conversion() {
        let settings = HubConfig::default().hub_settings();
        assert_eq!(settings.queue_capacity, 256);
        assert_eq!(settings.liveness_timeout, Duration::from_secs(45));
        assert_eq!(settings.close_grace, Duration::from_secs(5));
    }
}
