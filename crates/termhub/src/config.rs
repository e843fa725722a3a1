//! Configuration management for the termhub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termhub/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{
    ManagerOptions, QueueLimits, SessionOptions, TerminalSize, DEFAULT_SUBSCRIBER_CAPACITY,
};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("default_command must name a program")]
    EmptyDefaultCommand,

    #[error("default_command program does not exist: {0}")]
    InvalidDefaultCommand(String),

    #[error("buffer_capacity must be greater than 0")]
    InvalidBufferCapacity,

    #[error("max_in_flight must be greater than 0")]
    InvalidMaxInFlight,

    #[error("default terminal size must be positive, got {rows}x{cols}")]
    InvalidTerminalSize { rows: u16, cols: u16 },

    #[error("subscriber_capacity must be greater than 0")]
    InvalidSubscriberCapacity,

    #[error("{0} must be greater than 0")]
    ZeroInterval(&'static str),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the termhub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session defaults and limits.
    pub session: SessionConfig,

    /// Live output fan-out.
    pub broadcast: BroadcastConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Control socket location. Defaults to the per-user runtime directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

/// Session defaults and limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Program and arguments used when a create request names none.
    pub default_command: Vec<String>,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Output bytes retained per session.
    pub buffer_capacity: usize,

    /// Commands allowed to execute at once per session.
    pub max_in_flight: usize,

    /// Queue commands beyond `max_in_flight` instead of rejecting them.
    pub queue_commands: bool,

    /// Waiting commands allowed per session.
    pub max_queued: usize,

    /// Quiet period after which a command counts as finished.
    pub debounce_ms: u64,

    /// Wait for first output before a new session counts as ready.
    pub launch_timeout_ms: u64,

    /// Sessions without activity for this long are terminated.
    pub idle_timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL.
    pub grace_period_ms: u64,

    /// Wait for the child after SIGKILL.
    pub kill_timeout_ms: u64,

    /// Reader poll interval.
    pub poll_interval_ms: u64,

    /// Output marker that completes the running command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_sentinel: Option<String>,

    /// How often finished and idle sessions are swept.
    pub sweep_interval_secs: u64,

    /// Terminal rows when a create request names none.
    pub default_rows: u16,

    /// Terminal columns when a create request names none.
    pub default_cols: u16,
}

/// Live output fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Output chunks queued per subscriber before the oldest are dropped.
    pub subscriber_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            socket_path: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_command: vec![default_shell()],
            max_sessions: 10,
            buffer_capacity: 10 * 1024 * 1024, // 10 MiB
            max_in_flight: 1,
            queue_commands: true,
            max_queued: 64,
            debounce_ms: 200,
            launch_timeout_ms: 500,
            idle_timeout_secs: 30 * 60,
            grace_period_ms: 3000,
            kill_timeout_ms: 2000,
            poll_interval_ms: 100,
            completion_sentinel: None,
            sweep_interval_secs: 30,
            default_rows: 24,
            default_cols: 80,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

/// The user's login shell, or `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl SessionConfig {
    /// Runtime options for each session.
    pub fn session_options(&self, broadcast: &BroadcastConfig) -> SessionOptions {
        SessionOptions {
            buffer_capacity: self.buffer_capacity,
            limits: QueueLimits {
                max_in_flight: self.max_in_flight,
                queue_commands: self.queue_commands,
                max_queued: self.max_queued,
            },
            debounce: Duration::from_millis(self.debounce_ms),
            launch_timeout: Duration::from_millis(self.launch_timeout_ms),
            grace_period: Duration::from_millis(self.grace_period_ms),
            kill_timeout: Duration::from_millis(self.kill_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            completion_sentinel: self.completion_sentinel.clone(),
            subscriber_capacity: broadcast.subscriber_capacity,
            default_size: TerminalSize::new(self.default_rows, self.default_cols)
                .unwrap_or_default(),
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMHUB_MAX_SESSIONS: Override the session ceiling
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(max) = std::env::var("TERMHUB_MAX_SESSIONS") {
            if !max.is_empty() {
                match max.trim().parse::<usize>() {
                    Ok(max) => {
                        tracing::info!("Overriding max_sessions from environment: {}", max);
                        self.session.max_sessions = max;
                    }
                    Err(_) => {
                        tracing::warn!("Ignoring non-numeric TERMHUB_MAX_SESSIONS: {}", max);
                    }
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        let program = session
            .default_command
            .first()
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::EmptyDefaultCommand)?;
        let program_path = Path::new(program);
        let found = if program_path.is_absolute() {
            program_path.exists()
        } else {
            which::which(program).is_ok()
        };
        if !found {
            return Err(ConfigError::InvalidDefaultCommand(program.clone()));
        }

        if session.buffer_capacity == 0 {
            return Err(ConfigError::InvalidBufferCapacity);
        }
        if session.max_in_flight == 0 {
            return Err(ConfigError::InvalidMaxInFlight);
        }
        if session.default_rows == 0 || session.default_cols == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                rows: session.default_rows,
                cols: session.default_cols,
            });
        }
        if session.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("poll_interval_ms"));
        }
        if session.kill_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval("kill_timeout_ms"));
        }
        if session.sweep_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("sweep_interval_secs"));
        }
        if session.idle_timeout_secs == 0 {
            return Err(ConfigError::ZeroInterval("idle_timeout_secs"));
        }

        if self.broadcast.subscriber_capacity == 0 {
            return Err(ConfigError::InvalidSubscriberCapacity);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Registry options derived from the session and broadcast sections.
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            max_sessions: self.session.max_sessions,
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.session.sweep_interval_secs),
            default_command: self.session.default_command.clone(),
            session: self.session.session_options(&self.broadcast),
        }
    }

    /// The configured socket path, or the per-user default.
    pub fn socket_path(&self) -> PathBuf {
        self.daemon
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

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    /// A config that validates on any Unix host.
    fn valid() -> Config {
        let mut config = Config::default();
        config.session.default_command = vec!["/bin/sh".to_string()];
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.socket_path, None);
        assert_eq!(config.session.max_sessions, 10);
        assert_eq!(config.session.buffer_capacity, 10 * 1024 * 1024);
        assert_eq!(config.session.max_in_flight, 1);
        assert!(config.session.queue_commands);
        assert_eq!(config.session.debounce_ms, 200);
        assert_eq!(config.session.grace_period_ms, 3000);
        assert_eq!(config.broadcast.subscriber_capacity, 256);
        assert!(!config.session.default_command.is_empty());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
max_sessions = 5
completion_sentinel = "__DONE__"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.max_sessions, 5);
        assert_eq!(
            config.session.completion_sentinel.as_deref(),
            Some("__DONE__")
        );
        // Unspecified values keep their defaults
        assert_eq!(config.session.poll_interval_ms, 100);
        assert_eq!(config.broadcast, BroadcastConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "warn"
socket_path = "/run/termhub/test.sock"

[session]
default_command = ["/bin/bash", "--noprofile"]
max_sessions = 20
buffer_capacity = 65536
max_in_flight = 2
queue_commands = false
max_queued = 8
debounce_ms = 50
launch_timeout_ms = 250
idle_timeout_secs = 60
grace_period_ms = 1000
kill_timeout_ms = 500
poll_interval_ms = 20
sweep_interval_secs = 5
default_rows = 40
default_cols = 120

[broadcast]
subscriber_capacity = 32
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(
            config.daemon.socket_path,
            Some(PathBuf::from("/run/termhub/test.sock"))
        );
        assert_eq!(
            config.session.default_command,
            vec!["/bin/bash".to_string(), "--noprofile".to_string()]
        );
        assert!(!config.session.queue_commands);
        assert_eq!(config.session.default_rows, 40);
        assert_eq!(config.broadcast.subscriber_capacity, 32);
        assert_eq!(config.socket_path(), PathBuf::from("/run/termhub/test.sock"));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[session\nmax_sessions = 5");
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[session]\nmax_sessions = \"ten\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[session]
max_sessions = 3
unknown_field = true

[network]
signaling_url = "wss://example.com"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.session.max_sessions, 3);
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = Config::default();
        config.session.completion_sentinel = Some("$ ".to_string());
        config.session.max_queued = 3;
        config.daemon.socket_path = Some(PathBuf::from("/tmp/x.sock"));

        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.session.max_sessions = 42;
        config.save(&path).unwrap();

        assert!(path.exists());
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("termhub/config.toml"));
    }

    #[test]
    fn test_session_options_conversion() {
        let mut config = Config::default();
        config.session.debounce_ms = 75;
        config.session.max_in_flight = 3;
        config.session.queue_commands = false;
        config.session.default_rows = 50;
        config.session.default_cols = 132;
        config.broadcast.subscriber_capacity = 8;

        let options = config.manager_options();
        assert_eq!(options.max_sessions, 10);
        assert_eq!(options.idle_timeout, Duration::from_secs(1800));
        assert_eq!(options.session.debounce, Duration::from_millis(75));
        assert_eq!(options.session.limits.max_in_flight, 3);
        assert!(!options.session.limits.queue_commands);
        assert_eq!(options.session.subscriber_capacity, 8);
        assert_eq!(options.session.default_size.rows(), 50);
        assert_eq!(options.session.default_size.cols(), 132);
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        let original = std::env::var("TERMHUB_LOG_LEVEL").ok();

        // SAFETY: serialized with the other env-var tests
        unsafe {
            std::env::set_var("TERMHUB_LOG_LEVEL", "trace");
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "trace");

        // SAFETY: serialized with the other env-var tests
        unsafe {
            match original {
                Some(val) => std::env::set_var("TERMHUB_LOG_LEVEL", val),
                None => std::env::remove_var("TERMHUB_LOG_LEVEL"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        let original = std::env::var("TERMHUB_LOG_LEVEL").ok();

        // SAFETY: serialized with the other env-var tests
        unsafe {
            std::env::set_var("TERMHUB_LOG_LEVEL", "");
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "info");

        // SAFETY: serialized with the other env-var tests
        unsafe {
            match original {
                Some(val) => std::env::set_var("TERMHUB_LOG_LEVEL", val),
                None => std::env::remove_var("TERMHUB_LOG_LEVEL"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_env_override_max_sessions() {
        let original = std::env::var("TERMHUB_MAX_SESSIONS").ok();

        // SAFETY: serialized with the other env-var tests
        unsafe {
            std::env::set_var("TERMHUB_MAX_SESSIONS", "3");
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.max_sessions, 3);

        // Garbage is ignored
        // SAFETY: serialized with the other env-var tests
        unsafe {
            std::env::set_var("TERMHUB_MAX_SESSIONS", "lots");
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.max_sessions, 10);

        // SAFETY: serialized with the other env-var tests
        unsafe {
            match original {
                Some(val) => std::env::set_var("TERMHUB_MAX_SESSIONS", val),
                None => std::env::remove_var("TERMHUB_MAX_SESSIONS"),
            }
        }
    }

    #[test]
    fn test_validate_default_config() {
        assert_eq!(valid().validate(), Ok(()));
    }

    #[test]
    fn test_validate_max_sessions_bounds() {
        let mut config = valid();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.session.max_sessions = 1;
        assert!(config.validate().is_ok());
        config.session.max_sessions = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_default_command() {
        let mut config = valid();
        config.session.default_command = vec![];
        assert_eq!(config.validate(), Err(ConfigError::EmptyDefaultCommand));

        config.session.default_command = vec!["/nonexistent/shell".to_string()];
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDefaultCommand(
                "/nonexistent/shell".to_string()
            ))
        );

        config.session.default_command = vec!["sh".to_string(), "-i".to_string()];
        assert!(config.validate().is_ok());

        config.session.default_command = vec!["definitely-not-a-real-shell-xyz".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDefaultCommand(_))
        ));
    }

    #[test]
    fn test_validate_zero_values() {
        let mut config = valid();
        config.session.buffer_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBufferCapacity));

        let mut config = valid();
        config.session.max_in_flight = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxInFlight));

        let mut config = valid();
        config.session.default_cols = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize { rows: 24, cols: 0 })
        );

        let mut config = valid();
        config.session.poll_interval_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("poll_interval_ms"))
        );

        let mut config = valid();
        config.broadcast.subscriber_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidSubscriberCapacity));
    }

    #[test]
    fn test_validate_grace_period_may_be_zero() {
        let mut config = valid();
        config.session.grace_period_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        for level in ["trace", "debug", "info", "warn", "error", "DEBUG"] {
            let mut config = valid();
            config.daemon.log_level = level.to_string();
            assert!(config.validate().is_ok(), "{level} should be valid");
        }

        let mut config = valid();
        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
