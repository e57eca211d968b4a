//! Configuration management for the ptyrelay daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptyrelay/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::{RelayConfig, DEFAULT_LISTEN_ADDR};
use crate::session::{PumpConfig, RegistryConfig, ShellKind};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("default_shell must be one of bash, zsh, fish, sh; got {0:?}")]
    InvalidShell(String),

    #[error("default_shell {0:?} was not found on PATH")]
    ShellNotFound(String),

    #[error("listen_addr must be a socket address like 127.0.0.1:8765, got {0:?}")]
    InvalidListenAddr(String),

    #[error("flush_interval_ms must be between 1 and 1000, got {0}")]
    InvalidFlushInterval(u64),

    #[error("poll_interval_ms must be between 1 and 1000, got {0}")]
    InvalidPollInterval(u64),

    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidDimensions { cols: u16, rows: u16 },

    #[error("term must not be empty")]
    EmptyTerm,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the ptyrelay daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket relay configuration.
    pub relay: RelaySettings,

    /// Session configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write logs to this file when set.
    pub log_file: Option<PathBuf>,
}

/// WebSocket relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaySettings {
    /// Address the relay listener binds to.
    pub listen_addr: String,

    /// How often pending output is flushed to a consumer, in milliseconds.
    pub flush_interval_ms: u64,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used when a request names one outside the allow-list.
    pub default_shell: String,

    /// Columns used by `sessions create` when none are given.
    pub default_cols: u16,

    /// Rows used by `sessions create` when none are given.
    pub default_rows: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Output pump readiness wait in milliseconds.
    pub poll_interval_ms: u64,

    /// Transcript cap per session in bytes (0 = unbounded).
    pub max_log_bytes: usize,

    /// Value of `TERM` for spawned shells.
    pub term: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            flush_interval_ms: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: ShellKind::default().to_string(),
            default_cols: protocol::DEFAULT_COLS,
            default_rows: protocol::DEFAULT_ROWS,
            max_sessions: 10,
            poll_interval_ms: 10,
            max_log_bytes: 0,
            term: "xterm-256color".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyrelay")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyrelay")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYRELAY_LISTEN_ADDR: Override the relay listen address
    /// - PTYRELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYRELAY_DEFAULT_SHELL: Override the default shell
    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = non_empty_env("PTYRELAY_LISTEN_ADDR") {
            tracing::info!(listen_addr = %addr, "Overriding listen_addr from environment");
            self.relay.listen_addr = addr;
        }

        if let Some(level) = non_empty_env("PTYRELAY_LOG_LEVEL") {
            tracing::info!(log_level = %level, "Overriding log_level from environment");
            self.daemon.log_level = level;
        }

        if let Some(shell) = non_empty_env("PTYRELAY_DEFAULT_SHELL") {
            tracing::info!(default_shell = %shell, "Overriding default_shell from environment");
            self.session.default_shell = shell;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        let shell = self.default_shell()?;
        if which::which(shell.program()).is_err() {
            return Err(ConfigError::ShellNotFound(shell.program().to_string()));
        }

        if self.relay.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(self.relay.listen_addr.clone()));
        }

        if !(1..=1000).contains(&self.relay.flush_interval_ms) {
            return Err(ConfigError::InvalidFlushInterval(self.relay.flush_interval_ms));
        }

        if !(1..=1000).contains(&self.session.poll_interval_ms) {
            return Err(ConfigError::InvalidPollInterval(self.session.poll_interval_ms));
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidDimensions {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        if self.session.term.trim().is_empty() {
            return Err(ConfigError::EmptyTerm);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// The configured default shell, parsed against the allow-list.
    pub fn default_shell(&self) -> Result<ShellKind, ConfigError> {
        self.session
            .default_shell
            .parse()
            .map_err(|_| ConfigError::InvalidShell(self.session.default_shell.clone()))
    }

    /// Registry settings derived from this configuration.
    ///
    /// Call [`Config::validate`] first; an invalid default shell falls back
    /// to the built-in default here.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            default_shell: self.default_shell().unwrap_or_default(),
            max_sessions: self.session.max_sessions,
            term: self.session.term.clone(),
            cwd: None,
            max_log_bytes: self.session.max_log_bytes,
            pumps: PumpConfig {
                poll_interval: Duration::from_millis(self.session.poll_interval_ms),
                ..PumpConfig::default()
            },
        }
    }

    /// Relay settings derived from this configuration.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            flush_interval: Duration::from_millis(self.relay.flush_interval_ms),
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
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

    /// Save configuration to a file, creating parent directories.
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

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
