//! TOML-based configuration for the BrlAPI server.
//!
//! ```toml
//! [server]
//! hosts = ":0+127.0.0.1:0"
//! auth_key_path = "/etc/brlapi.key"
//! socket_dir = "/var/lib/BrlAPI"
//! log_level = "info"
//!
//! [limits]
//! unauth_max = 5
//! unauth_timeout_secs = 30
//!
//! [display]
//! driver = "virtual"
//! columns = 40
//! rows = 1
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "some_fn")]`, so an empty file, a
//! file with only `[server]`, or no file at all yields a working server.
//! Command-line flags are applied on top of the loaded values by `main.rs`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration and key file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The authentication key file exists but holds no key.
    #[error("authentication key file {0} is empty")]
    EmptyKey(PathBuf),

    /// A value is syntactically valid but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

/// Where to listen and how to authenticate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    /// `+`-separated endpoints; `:n` is a local socket, `host:n` is TCP.
    #[serde(default = "default_hosts")]
    pub hosts: String,
    /// File holding the shared key clients must present.
    #[serde(default = "default_auth_key_path")]
    pub auth_key_path: PathBuf,
    /// Directory for local sockets.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Resource limits and timings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Connections allowed to sit unauthenticated at once.
    #[serde(default = "default_unauth_max")]
    pub unauth_max: usize,
    /// Seconds an unauthenticated connection may live.
    #[serde(default = "default_unauth_timeout_secs")]
    pub unauth_timeout_secs: u64,
    /// Interval of the display output cycle.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay between bind attempts on a busy address.
    #[serde(default = "default_bind_retry_ms")]
    pub bind_retry_ms: u64,
    /// Upper bound on tty nodes in the tree.
    #[serde(default = "default_max_ttys")]
    pub max_ttys: usize,
}

/// The braille display to drive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayConfig {
    /// Driver name.  Only `"virtual"` is built in.
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default = "default_columns")]
    pub columns: u32,
    #[serde(default = "default_rows")]
    pub rows: u32,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_hosts() -> String {
    ":0+127.0.0.1:0".to_string()
}
fn default_auth_key_path() -> PathBuf {
    PathBuf::from("/etc/brlapi.key")
}
fn default_socket_dir() -> PathBuf {
    PathBuf::from("/var/lib/BrlAPI")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_unauth_max() -> usize {
    5
}
fn default_unauth_timeout_secs() -> u64 {
    30
}
fn default_poll_interval_ms() -> u64 {
    40
}
fn default_bind_retry_ms() -> u64 {
    1000
}
fn default_max_ttys() -> usize {
    4096
}
fn default_driver() -> String {
    "virtual".to_string()
}
fn default_columns() -> u32 {
    40
}
fn default_rows() -> u32 {
    1
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            auth_key_path: default_auth_key_path(),
            socket_dir: default_socket_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            unauth_max: default_unauth_max(),
            unauth_timeout_secs: default_unauth_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            bind_retry_ms: default_bind_retry_ms(),
            max_ttys: default_max_ttys(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            columns: default_columns(),
            rows: default_rows(),
        }
    }
}

impl ServerConfig {
    /// Rejects values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.display.columns == 0 || self.display.rows == 0 {
            return Err(ConfigError::Invalid(
                "display.columns and display.rows must be positive".to_string(),
            ));
        }
        if self.limits.unauth_max == 0 {
            return Err(ConfigError::Invalid(
                "limits.unauth_max must be positive".to_string(),
            ));
        }
        if self.limits.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "limits.poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Parses configuration from TOML text.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] if the TOML is malformed.
pub fn from_toml_str(content: &str) -> Result<ServerConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Loads configuration from `path`, returning defaults when the file does not
/// exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => from_toml_str(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Reads the shared authentication key.
///
/// The key is an opaque byte string; a single trailing newline, as left by
/// most editors, is not part of it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read and
/// [`ConfigError::EmptyKey`] if it holds nothing.
pub fn load_auth_key(path: &Path) -> Result<Vec<u8>, ConfigError> {
    let mut key = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if key.last() == Some(&b'\n') {
        key.pop();
    }
    if key.is_empty() {
        return Err(ConfigError::EmptyKey(path.to_path_buf()));
    }
    Ok(key)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
