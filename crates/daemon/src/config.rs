//! Configuration management for the shellmux daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellmux/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::charset::{EncodingError, Transcoder};
use crate::session::monitor::{MAX_IDLE, SWEEP_INTERVAL};
use crate::session::ShellCommand;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("shell not found: {0}")]
    InvalidShellPath(String),

    #[error("local_encoding is not usable: {0}")]
    InvalidEncoding(#[from] EncodingError),

    #[error("idle_timeout_secs must be between 1 and 86400, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("sweep_interval_secs must be at least 1 and less than idle_timeout_secs ({idle}), got {sweep}")]
    InvalidSweepInterval { sweep: u64, idle: u64 },
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Longest idle timeout accepted, one day.
const MAX_IDLE_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Main configuration structure for the shellmux daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rotated log files. Logs go to stderr only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Interpreter started for every session.
    pub shell: String,

    /// Arguments passed to the interpreter.
    pub shell_args: Vec<String>,

    /// WHATWG label of the interpreter's text encoding. The platform default
    /// applies when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_encoding: Option<String>,

    /// Seconds without input, ping or output before a session is evicted.
    pub idle_timeout_secs: u64,

    /// Seconds between idle sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            shell_args: Vec::new(),
            local_encoding: None,
            idle_timeout_secs: MAX_IDLE.as_secs(),
            sweep_interval_secs: SWEEP_INTERVAL.as_secs(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellmux")
        .join("config.toml")
}

/// Returns the default interpreter for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl SessionConfig {
    /// The interpreter command sessions run.
    pub fn shell_command(&self) -> ShellCommand {
        ShellCommand::new(self.shell.clone()).with_args(self.shell_args.iter().cloned())
    }

    /// The transcoder for the configured (or platform) local encoding.
    pub fn transcoder(&self) -> Result<Transcoder, EncodingError> {
        Transcoder::from_label_or_platform(self.local_encoding.as_deref())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHELLMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SHELLMUX_SHELL: Override the session interpreter
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SHELLMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(shell) = std::env::var("SHELLMUX_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell from environment: {}", shell);
                self.session.shell = shell;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        let shell_path = Path::new(&self.session.shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        self.session.transcoder()?;

        let idle = self.session.idle_timeout_secs;
        if idle == 0 || idle > MAX_IDLE_TIMEOUT_SECS {
            return Err(ConfigError::InvalidIdleTimeout(idle));
        }

        let sweep = self.session.sweep_interval_secs;
        if sweep == 0 || sweep >= idle {
            return Err(ConfigError::InvalidSweepInterval { sweep, idle });
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
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

    /// Save configuration to a file, creating parent directories as needed.
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

    /// A config that validates on any unix host.
    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_dir.is_none());
        assert!(config.session.shell_args.is_empty());
        assert!(config.session.local_encoding.is_none());
        assert_eq!(config.session.idle_timeout_secs, 300);
        assert_eq!(config.session.sweep_interval_secs, 30);
    }

    #[test]
    fn test_default_shell() {
        let shell = default_shell();
        assert!(!shell.is_empty());
        if cfg!(windows) {
            assert_eq!(shell, "cmd.exe");
        }
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[session]
idle_timeout_secs = 600
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.session.idle_timeout_secs, 600);
        assert_eq!(config.session.sweep_interval_secs, 30);
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"
log_dir = "/var/log/shellmux"

[session]
shell = "/bin/bash"
shell_args = ["--norc"]
local_encoding = "gbk"
idle_timeout_secs = 120
sweep_interval_secs = 10
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.daemon.log_dir, Some(PathBuf::from("/var/log/shellmux")));
        assert_eq!(config.session.shell, "/bin/bash");
        assert_eq!(config.session.shell_args, vec!["--norc"]);
        assert_eq!(config.session.local_encoding.as_deref(), Some("gbk"));
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.session.sweep_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[daemon\nlog_level = \"debug\"\n");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
idle_timeout_secs = "forever"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = valid_config();
        original.daemon.log_dir = Some(PathBuf::from("/tmp/logs"));
        original.session.local_encoding = Some("shift_jis".to_string());
        original.session.shell_args = vec!["-i".to_string()];

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[session]"));

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

        let mut original = valid_config();
        original.daemon.log_level = "debug".to_string();

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
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("shellmux"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_shell_command() {
        let mut config = valid_config();
        config.session.shell_args = vec!["-e".to_string()];

        let cmd = config.session.shell_command();
        assert_eq!(cmd.program, "/bin/sh");
        assert_eq!(cmd.args, vec!["-e"]);
    }

    #[test]
    fn test_transcoder_selection() {
        let mut config = valid_config();
        assert_eq!(config.session.transcoder().unwrap(), Transcoder::for_platform());

        config.session.local_encoding = Some("gb18030".to_string());
        assert!(!config.session.transcoder().unwrap().is_passthrough());
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_default() {
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_shell() {
        let mut config = valid_config();
        config.session.shell = "/nonexistent/shell".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));

        config.session.shell = "definitely-not-a-shell-xyz".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_encoding() {
        let mut config = valid_config();
        config.session.local_encoding = Some("klingon".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidEncoding(EncodingError::UnknownLabel(
                "klingon".to_string()
            )))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_intervals() {
        let mut config = valid_config();
        config.session.idle_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidIdleTimeout(0)));

        config.session.idle_timeout_secs = 60;
        config.session.sweep_interval_secs = 60;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidSweepInterval { sweep: 60, idle: 60 })
        );

        config.session.sweep_interval_secs = 0;
        assert!(config.validate().is_err());

        config.session.sweep_interval_secs = 5;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("SHELLMUX_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "trace");

        std::env::remove_var("SHELLMUX_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_shell() {
        std::env::set_var("SHELLMUX_SHELL", "/bin/dash");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.shell, "/bin/dash");

        std::env::remove_var("SHELLMUX_SHELL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("SHELLMUX_LOG_LEVEL", "");
        std::env::set_var("SHELLMUX_SHELL", "");

        let mut config = valid_config();
        config.apply_env_overrides();
        assert_eq!(config, valid_config());

        std::env::remove_var("SHELLMUX_LOG_LEVEL");
        std::env::remove_var("SHELLMUX_SHELL");
    }
}
