//! Configuration management for the cfdevd daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `/etc/cfdevd/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default path of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cfdevd/config.toml";

/// Name under which the activation mechanism hands over the listening socket.
pub const DEFAULT_SOCKET_NAME: &str = "ListenSocket";

/// Label the daemon is registered under.
pub const DEFAULT_LABEL: &str = "org.cloudfoundry.cfdevd";

/// Path the activation mechanism binds the socket to.
pub const DEFAULT_SOCKET_PATH: &str = "/var/tmp/cfdevd.socket";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The log level is not a known tracing level.
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    /// No activated socket name is configured.
    #[error("socket_name must not be empty")]
    EmptySocketName,

    /// The service label is empty.
    #[error("service label must not be empty")]
    EmptyLabel,

    /// A path the service manager needs is relative.
    #[error("{field} must be an absolute path, got {path}")]
    RelativePath { field: &'static str, path: String },

    /// Graceful shutdown would never wait.
    #[error("drain_timeout_secs must be greater than 0 in graceful shutdown mode")]
    InvalidDrainTimeout,

    /// No interface to alias addresses on.
    #[error("network interface must not be empty")]
    EmptyInterface,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the cfdevd daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Connection dispatcher configuration.
    pub server: ServerConfig,

    /// Handshake authentication settings.
    pub auth: AuthConfig,

    /// Settings for the network commands.
    pub network: NetworkConfig,

    /// Service registration settings.
    pub service: ServiceConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Name of the activated socket to serve on.
    pub socket_name: String,
}

/// What happens to in-flight connections when a shutdown signal arrives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Exit immediately, abandoning in-flight connections.
    #[default]
    Abrupt,
    /// Stop accepting and wait for in-flight connections, bounded by a timeout.
    Graceful,
}

/// Connection dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum number of concurrently served connections (0 = unbounded).
    pub max_connections: usize,

    /// Shutdown behavior on SIGINT/SIGTERM.
    pub shutdown: ShutdownMode,

    /// Upper bound on the graceful drain, in seconds.
    pub drain_timeout_secs: u64,

    /// Upper bound on the handshake, in seconds (0 = no timeout).
    pub handshake_timeout_secs: u64,
}

/// Which checks a connection must pass before its command is read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AuthStrategy {
    /// Peer uid must be on the allow-list.
    #[serde(rename = "peer-credentials")]
    PeerCredentials,
    /// Greeting exchange only.
    #[serde(rename = "greeting")]
    Greeting,
    /// Peer credentials first, then the greeting exchange.
    #[default]
    #[serde(rename = "peer-credentials+greeting")]
    PeerCredentialsAndGreeting,
}

/// Handshake authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Authentication strategy.
    pub strategy: AuthStrategy,

    /// Uids allowed to connect. Empty means root and the daemon's own uid.
    pub allowed_uids: Vec<u32>,
}

/// Settings for the network commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface receiving address aliases.
    pub interface: String,
}

/// Service registration settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service label, also used as the unit name.
    pub label: String,

    /// Where the executable is installed.
    pub program: PathBuf,

    /// Path the activated socket is bound to.
    pub socket_path: PathBuf,

    /// Standard output redirection of the installed service.
    pub stdout_path: PathBuf,

    /// Standard error redirection of the installed service.
    pub stderr_path: PathBuf,

    /// Directory receiving the unit files.
    pub unit_dir: PathBuf,

    /// Whether install/uninstall drive `systemctl`.
    pub manage_units: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            socket_name: DEFAULT_SOCKET_NAME.to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            shutdown: ShutdownMode::Abrupt,
            drain_timeout_secs: 10,
            handshake_timeout_secs: 0,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: default_interface().to_string(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            label: DEFAULT_LABEL.to_string(),
            program: PathBuf::from("/usr/local/libexec").join(DEFAULT_LABEL),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            stdout_path: PathBuf::from("/var/tmp/cfdevd.stdout.log"),
            stderr_path: PathBuf::from("/var/tmp/cfdevd.stderr.log"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            manage_units: true,
        }
    }
}

/// Loopback interface name for the current platform.
fn default_interface() -> &'static str {
    if cfg!(target_os = "macos") {
        "lo0"
    } else {
        "lo"
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

impl ServerConfig {
    /// Admission limit, or `None` when unbounded.
    pub fn connection_limit(&self) -> Option<usize> {
        (self.max_connections > 0).then_some(self.max_connections)
    }

    /// Handshake timeout, or `None` when handshakes may block forever.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_secs > 0).then(|| Duration::from_secs(self.handshake_timeout_secs))
    }

    /// Upper bound on the graceful drain.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - CFDEVD_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - CFDEVD_SOCKET_NAME: Override the activated socket name
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("CFDEVD_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(name) = std::env::var("CFDEVD_SOCKET_NAME") {
            if !name.is_empty() {
                tracing::info!("Overriding socket_name from environment: {}", name);
                self.daemon.socket_name = name;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.daemon.socket_name.is_empty() {
            return Err(ConfigError::EmptySocketName);
        }

        if self.server.shutdown == ShutdownMode::Graceful && self.server.drain_timeout_secs == 0 {
            return Err(ConfigError::InvalidDrainTimeout);
        }

        if self.network.interface.is_empty() {
            return Err(ConfigError::EmptyInterface);
        }

        if self.service.label.is_empty() {
            return Err(ConfigError::EmptyLabel);
        }

        let paths = [
            ("program", &self.service.program),
            ("socket_path", &self.service.socket_path),
            ("stdout_path", &self.service.stdout_path),
            ("stderr_path", &self.service.stderr_path),
            ("unit_dir", &self.service.unit_dir),
        ];
        for (field, path) in paths {
            if !path.is_absolute() {
                return Err(ConfigError::RelativePath {
                    field,
                    path: path.display().to_string(),
                });
            }
        }

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
