//! Link configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via DANALINK_CONFIG)
//! 3. Environment variables

use danalink_protocol::DEFAULT_WRITE_LIMIT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Full configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Link session settings.
    pub link: LinkConfig,
    /// Keep-alive and reconnect settings.
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("DANALINK_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Applies overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.link.apply_overrides(&lookup);
        self.supervisor.apply_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link.write_limit == 0 {
            return Err(ConfigError::Validation("link.write_limit must be at least 1".into()));
        }
        if self.link.request_timeout_ms == 0 || self.link.history_timeout_ms == 0 {
            return Err(ConfigError::Validation("request timeouts must be non-zero".into()));
        }
        if self.supervisor.keepalive_secs == 0 {
            return Err(ConfigError::Validation("supervisor.keepalive_secs must be non-zero".into()));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", key, value);
            None
        }
    }
}

/// Link session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Deadline for ordinary requests in milliseconds.
    pub request_timeout_ms: u64,
    /// Deadline for history requests in milliseconds.
    pub history_timeout_ms: u64,
    /// Deadline for the whole pairing handshake in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Largest single transport write in bytes.
    pub write_limit: usize,
    /// Password programmed into DEFAULT generation pumps.
    pub device_password: Option<u16>,
    /// Skip the DEFAULT generation password check.
    pub ignore_password: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            history_timeout_ms: 20_000,
            handshake_timeout_ms: 15_000,
            write_limit: DEFAULT_WRITE_LIMIT,
            device_password: None,
            ignore_password: false,
        }
    }
}

impl LinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn with_history_timeout(mut self, timeout: Duration) -> Self {
        self.history_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = limit.max(1);
        self
    }

    pub fn with_device_password(mut self, password: u16) -> Self {
        self.device_password = Some(password);
        self
    }

    pub fn with_ignore_password(mut self, ignore: bool) -> Self {
        self.ignore_password = ignore;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(ms) = parse_override(lookup, "DANALINK_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = ms;
        }
        if let Some(ms) = parse_override(lookup, "DANALINK_HISTORY_TIMEOUT_MS") {
            self.history_timeout_ms = ms;
        }
        if let Some(limit) = parse_override(lookup, "DANALINK_WRITE_LIMIT") {
            self.write_limit = limit;
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interval between keep-alive pings in seconds.
    pub keepalive_secs: u64,
    /// Delay before each reconnect attempt in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Consecutive failed reconnects before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 30,
            reconnect_delay_ms: 1_000,
            max_reconnect_attempts: 0,
        }
    }
}

impl SupervisorConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(secs) = parse_override(lookup, "DANALINK_KEEPALIVE_SECS") {
            self.keepalive_secs = secs;
        }
        if let Some(ms) = parse_override(lookup, "DANALINK_RECONNECT_DELAY_MS") {
            self.reconnect_delay_ms = ms;
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
