//! Configuration management for the TermDeck daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termdeck/config.toml`.
//!
//! Application settings edited by the user (theme, fonts, search paths) are
//! not stored here; they live in the persisted envelope managed by
//! [`crate::persistence`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("default_cols must be between 1 and 1000, got {0}")]
    InvalidDefaultCols(u16),

    #[error("default_rows must be between 1 and 1000, got {0}")]
    InvalidDefaultRows(u16),

    #[error("debounce_ms must be at most 5000, got {0}")]
    InvalidDebounce(u64),

    #[error("settle_ms must be at most 5000, got {0}")]
    InvalidSettle(u64),

    #[error("pending_capacity must be between 1 and 10000, got {0}")]
    InvalidPendingCapacity(usize),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for the resize timers, in milliseconds.
const MAX_RESIZE_DELAY_MS: u64 = 5000;

/// Main configuration structure for the TermDeck daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Command-surface socket configuration.
    pub ipc: IpcConfig,

    /// Defaults for new sessions.
    pub session: SessionConfig,

    /// Resize coordination timings.
    pub resize: ResizeConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the persisted store and log files.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write logs to a daily-rotated file under `data_dir/logs`.
    pub log_to_file: bool,
}

/// Command-surface socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct IpcConfig {
    /// Socket path override. When unset, the XDG runtime location is used.
    pub socket_path: Option<PathBuf>,
}

/// Defaults applied to new sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Width used when a create request carries zero columns.
    pub default_cols: u16,

    /// Height used when a create request carries zero rows.
    pub default_rows: u16,
}

/// Resize coordination timings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResizeConfig {
    /// Quiet period after the last container change before resizing.
    pub debounce_ms: u64,

    /// Wait after notifying new dimensions before flushing buffered output.
    pub settle_ms: u64,

    /// Maximum number of output chunks buffered during one resize.
    pub pending_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_cols: protocol::DEFAULT_COLS,
            default_rows: protocol::DEFAULT_ROWS,
        }
    }
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 150,
            settle_ms: 50,
            pending_capacity: 100,
        }
    }
}

impl ResizeConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termdeck")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termdeck")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMDECK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMDECK_DATA_DIR: Override the data directory
    /// - TERMDECK_SOCKET: Override the command-surface socket path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMDECK_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("TERMDECK_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(socket) = std::env::var("TERMDECK_SOCKET") {
            if !socket.is_empty() {
                tracing::info!("Overriding socket_path from environment: {}", socket);
                self.ipc.socket_path = Some(PathBuf::from(socket));
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if !(1..=1000).contains(&self.session.default_cols) {
            return Err(ConfigError::InvalidDefaultCols(self.session.default_cols));
        }

        if !(1..=1000).contains(&self.session.default_rows) {
            return Err(ConfigError::InvalidDefaultRows(self.session.default_rows));
        }

        if self.resize.debounce_ms > MAX_RESIZE_DELAY_MS {
            return Err(ConfigError::InvalidDebounce(self.resize.debounce_ms));
        }

        if self.resize.settle_ms > MAX_RESIZE_DELAY_MS {
            return Err(ConfigError::InvalidSettle(self.resize.settle_ms));
        }

        if !(1..=10_000).contains(&self.resize.pending_capacity) {
            return Err(ConfigError::InvalidPendingCapacity(
                self.resize.pending_capacity,
            ));
        }

        Ok(())
    }

    /// Path of the persisted store inside the data directory.
    pub fn store_path(&self) -> PathBuf {
        self.daemon.data_dir.join(crate::persistence::STORE_FILE_NAME)
    }

    /// Path of the single-instance pid file.
    pub fn pid_file_path(&self) -> PathBuf {
        crate::ipc::pidfile::pid_file_in(&self.daemon.data_dir)
    }

    /// Socket path, honouring the configured override.
    pub fn socket_path(&self) -> PathBuf {
        self.ipc
            .socket_path
            .clone()
            .unwrap_or_else(crate::ipc::get_socket_path)
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
