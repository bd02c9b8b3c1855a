//! Configuration management for the Tether daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tether/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{MAX_DIMENSION, MIN_DIMENSION};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind must be a socket address like 127.0.0.1:8787, got {0}")]
    InvalidBindAddress(String),

    #[error("high_watermark ({high}) must be greater than low_watermark ({low})")]
    InvalidWatermarks { high: usize, low: usize },

    #[error("default geometry must be within 10..=500, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("rate_limit.max_attempts must be at least 1, got {0}")]
    InvalidRateLimit(u32),

    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Tether daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener and socket settings.
    pub server: ServerConfig,

    /// Ticket and handshake settings.
    pub auth: AuthConfig,

    /// Terminal session settings.
    pub session: SessionConfig,

    /// Output streaming settings.
    pub stream: StreamConfig,

    /// Remote desktop proxy settings.
    pub desktop: DesktopConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for session logs, the ticket secret and the record store.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write daemon logs to daily files under `<data_dir>/logs/daemon`.
    pub log_to_file: bool,
}

/// Listener and socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the websocket server listens on.
    pub bind: String,

    /// Interval between server pings, in seconds.
    pub heartbeat_interval_secs: u64,

    /// A socket silent for this long is terminated, in seconds.
    pub heartbeat_timeout_secs: u64,
}

/// Ticket and handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Lifetime of issued tickets, in seconds.
    pub token_ttl_secs: u64,

    /// Time allowed for the first message on a socket, in milliseconds.
    pub auth_deadline_ms: u64,

    /// Failed-attempt limiter.
    pub rate_limit: RateLimitConfig,
}

/// Failed-attempt limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Fixed window length, in seconds.
    pub window_secs: u64,

    /// Attempts allowed per window.
    pub max_attempts: u32,

    /// Lockout after the window fills, in seconds (0 disables lockout).
    pub lock_secs: u64,
}

/// Terminal session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// tmux executable.
    pub tmux_bin: String,

    /// Login shell used to run every session.
    pub default_shell: String,

    /// Working directory when the requested one does not exist.
    pub default_cwd: Option<PathBuf>,

    /// Columns used when a spawn does not specify any.
    pub default_cols: u16,

    /// Rows used when a spawn does not specify any.
    pub default_rows: u16,

    /// Reconciliation interval, in milliseconds.
    pub reconcile_interval_ms: u64,

    /// Time between SIGTERM and SIGKILL on kill, in milliseconds.
    pub kill_grace_ms: u64,

    /// CLI kinds and the command each runs. An empty command runs the bare shell.
    pub clis: BTreeMap<String, String>,
}

/// Output streaming settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Output coalescing window, in milliseconds.
    pub batch_window_ms: u64,

    /// Pause output once this many bytes are queued unsent.
    pub high_watermark: usize,

    /// Resume output once queued bytes drop to this level.
    pub low_watermark: usize,

    /// Bytes replayed when a client does not ask for an offset.
    pub replay_tail_bytes: u64,

    /// Size of each replay and tail read, in bytes.
    pub read_chunk_bytes: usize,
}

/// Remote desktop proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DesktopConfig {
    /// Backend host.
    pub host: String,

    /// Backend port.
    pub port: u16,

    /// Commands tried in order when the backend is not reachable.
    pub candidates: Vec<String>,

    /// How long to wait for a started backend, in milliseconds.
    pub startup_timeout_ms: u64,

    /// Poll interval while waiting for the client to drain, in milliseconds.
    pub resume_poll_ms: u64,
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

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 12 * 60 * 60,
            auth_deadline_ms: 2_000,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_attempts: 6,
            lock_secs: 5 * 60,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let mut clis = BTreeMap::new();
        clis.insert("shell".to_string(), String::new());
        Self {
            tmux_bin: "tmux".to_string(),
            default_shell: default_shell(),
            default_cwd: None,
            default_cols: 120,
            default_rows: 36,
            reconcile_interval_ms: 2_000,
            kill_grace_ms: 3_000,
            clis,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 16,
            high_watermark: 1024 * 1024,
            low_watermark: 256 * 1024,
            replay_tail_bytes: 256 * 1024,
            read_chunk_bytes: 64 * 1024,
        }
    }
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5900,
            candidates: vec![
                "x11vnc -localhost -shared -forever -rfbport 5900".to_string(),
                "wayvnc 127.0.0.1 5900".to_string(),
            ],
            startup_timeout_ms: 8_000,
            resume_poll_ms: 50,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

/// Returns the login shell for new sessions.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl DaemonConfig {
    /// Directory holding per-session output logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Path of the ticket signing secret.
    pub fn secret_path(&self) -> PathBuf {
        self.data_dir.join("token.secret")
    }

    /// Path of the JSON record store.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    /// Path of the JSONL audit log.
    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("audit.log")
    }

    /// Path of the daemon PID file.
    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir.join("tetherd.pid")
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl AuthConfig {
    pub fn auth_deadline(&self) -> Duration {
        Duration::from_millis(self.auth_deadline_ms)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TETHER_BIND: Override the listen address
    /// - TETHER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TETHER_DATA_DIR: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("TETHER_BIND") {
            if !bind.is_empty() {
                tracing::info!("Overriding bind from environment: {}", bind);
                self.server.bind = bind;
            }
        }

        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("TETHER_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Parsed listen address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.server.bind.clone()))
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;

        if self.stream.high_watermark <= self.stream.low_watermark {
            return Err(ConfigError::InvalidWatermarks {
                high: self.stream.high_watermark,
                low: self.stream.low_watermark,
            });
        }

        let (cols, rows) = (self.session.default_cols, self.session.default_rows);
        let in_bounds = |v: u16| (MIN_DIMENSION..=MAX_DIMENSION).contains(&v);
        if !in_bounds(cols) || !in_bounds(rows) {
            return Err(ConfigError::InvalidGeometry { cols, rows });
        }

        if self.auth.rate_limit.max_attempts < 1 {
            return Err(ConfigError::InvalidRateLimit(
                self.auth.rate_limit.max_attempts,
            ));
        }

        for (name, value) in [
            ("auth.auth_deadline_ms", self.auth.auth_deadline_ms),
            ("auth.token_ttl_secs", self.auth.token_ttl_secs),
            ("auth.rate_limit.window_secs", self.auth.rate_limit.window_secs),
            ("session.reconcile_interval_ms", self.session.reconcile_interval_ms),
            ("server.heartbeat_interval_secs", self.server.heartbeat_interval_secs),
            ("stream.read_chunk_bytes", self.stream.read_chunk_bytes as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        let shell_path = Path::new(&self.session.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(
                    self.session.default_shell.clone(),
                ));
            }
        } else if which::which(&self.session.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
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

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(!config.daemon.log_to_file);
        assert_eq!(config.server.bind, "127.0.0.1:8787");
        assert_eq!(config.server.heartbeat_interval_secs, 15);
        assert_eq!(config.server.heartbeat_timeout_secs, 45);
        assert_eq!(config.auth.auth_deadline_ms, 2_000);
        assert_eq!(config.auth.rate_limit.window_secs, 60);
        assert_eq!(config.auth.rate_limit.max_attempts, 6);
        assert_eq!(config.auth.rate_limit.lock_secs, 300);
        assert_eq!(config.session.reconcile_interval_ms, 2_000);
        assert_eq!(config.session.kill_grace_ms, 3_000);
        assert_eq!(config.stream.batch_window_ms, 16);
        assert_eq!(config.stream.high_watermark, 1024 * 1024);
        assert_eq!(config.stream.low_watermark, 256 * 1024);
        assert_eq!(config.desktop.port, 5900);
        assert_eq!(config.desktop.startup_timeout_ms, 8_000);
        assert_eq!(config.desktop.resume_poll_ms, 50);
    }

    #[test]
    fn test_default_data_paths() {
        let config = DaemonConfig {
            data_dir: PathBuf::from("/var/lib/tether"),
            ..Default::default()
        };
        assert_eq!(config.logs_dir(), PathBuf::from("/var/lib/tether/logs"));
        assert_eq!(
            config.secret_path(),
            PathBuf::from("/var/lib/tether/token.secret")
        );
        assert_eq!(
            config.store_path(),
            PathBuf::from("/var/lib/tether/store.json")
        );
        assert!(DaemonConfig::default()
            .data_dir
            .to_string_lossy()
            .contains("tether"));
    }

    #[test]
    fn test_default_validates() {
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
bind = "0.0.0.0:9000"

[stream]
batch_window_ms = 5

[auth.rate_limit]
max_attempts = 3
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.stream.batch_window_ms, 5);
        assert_eq!(config.auth.rate_limit.max_attempts, 3);
        assert_eq!(config.auth.rate_limit.window_secs, 60);
        assert_eq!(config.stream.high_watermark, 1024 * 1024);
    }

    #[test]
    fn test_from_toml_clis() {
        let toml = r#"
[session.clis]
shell = ""
claude = "claude --continue"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.session.clis.len(), 2);
        assert_eq!(config.session.clis["claude"], "claude --continue");
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[server\nbind = 1");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.desktop.candidates = vec!["vncserver :1".to_string()];
        original.session.default_cwd = Some(PathBuf::from("/srv"));

        let toml = original.to_toml().unwrap();
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
        original.server.bind = "127.0.0.1:7000".to_string();

        original.save(&config_path).unwrap();
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
    fn test_validate_bind() {
        let mut config = valid_config();
        config.server.bind = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindAddress("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_watermarks() {
        let mut config = valid_config();
        config.stream.high_watermark = 100;
        config.stream.low_watermark = 100;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidWatermarks { high: 100, low: 100 })
        );
    }

    #[test]
    fn test_validate_geometry() {
        let mut config = valid_config();
        config.session.default_cols = 9;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidGeometry { cols: 9, rows: 36 })
        );

        config.session.default_cols = 500;
        config.session.default_rows = 501;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rate_limit() {
        let mut config = valid_config();
        config.auth.rate_limit.max_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidRateLimit(0)));
    }

    #[test]
    fn test_validate_zero_deadline() {
        let mut config = valid_config();
        config.auth.auth_deadline_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("auth.auth_deadline_ms"))
        );
    }

    #[test]
    fn test_validate_shell_path() {
        let mut config = valid_config();
        config.session.default_shell = "/nonexistent/shell".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.daemon.log_level = "DEBUG".to_string();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("TETHER_BIND", "0.0.0.0:1234");
        std::env::set_var("TETHER_LOG_LEVEL", "debug");
        std::env::set_var("TETHER_DATA_DIR", "/tmp/tether-env");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.bind, "0.0.0.0:1234");
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.data_dir, PathBuf::from("/tmp/tether-env"));

        std::env::remove_var("TETHER_BIND");
        std::env::remove_var("TETHER_LOG_LEVEL");
        std::env::remove_var("TETHER_DATA_DIR");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("TETHER_BIND", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.bind, "127.0.0.1:8787");

        std::env::remove_var("TETHER_BIND");
    }
}
