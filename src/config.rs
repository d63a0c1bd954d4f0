//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILSNARE_CONFIG` (environment variable)
//! 2. `~/.config/mailsnare/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailsnare\config.toml` (Windows)
//! 3. Built-in defaults
//!
//! Command-line flags override individual values after loading.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::store::DEFAULT_SUBSCRIBER_BUFFER;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// SMTP listener settings.
    pub smtp: SmtpConfig,
    /// Message store tuning.
    pub store: StoreConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Override directory for the log file.
    pub log_dir: Option<PathBuf>,
}

/// SMTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Interface to bind.
    pub ip: String,
    /// TCP port (0 picks a free port).
    pub port: u16,
    /// Name announced in the greeting and EHLO reply.
    pub hostname: String,
    /// Largest accepted message in bytes (default: 10 MB).
    pub max_message_size: usize,
    /// Largest number of RCPT TO per transaction.
    pub max_recipients: usize,
    /// Seconds a connection may stay silent before it is dropped (0 = never).
    pub idle_timeout_secs: u64,
}

/// Message store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Events buffered per live subscriber before it is disconnected.
    pub subscriber_buffer: usize,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 1025,
            hostname: "localhost".to_string(),
            max_message_size: 10 * 1024 * 1024, // 10 MB
            max_recipients: 100,
            idle_timeout_secs: 300,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl SmtpConfig {
    /// `ip:port` string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        if self.ip.contains(':') && !self.ip.starts_with('[') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

impl Config {
    /// Read and parse a specific config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

// ── Load ────────────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match Config::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path.display(), "Loaded config");
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to load config, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MAILSNARE_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mailsnare").join("config.toml"))
}

/// Return the directory holding the log file.
pub fn log_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.log_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailsnare")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.smtp.bind_addr(), "127.0.0.1:1025");
        assert_eq!(cfg.smtp.max_message_size, 10 * 1024 * 1024);
        assert_eq!(cfg.store.subscriber_buffer, DEFAULT_SUBSCRIBER_BUFFER);
        assert_eq!(cfg.general.log_level, "info");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[smtp]
port = 2525

[store]
subscriber_buffer = 8
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.smtp.port, 2525);
        assert_eq!(cfg.smtp.ip, "127.0.0.1");
        assert_eq!(cfg.store.subscriber_buffer, 8);
        assert_eq!(cfg.smtp.max_recipients, 100);
    }

    #[test]
    fn test_ipv6_bind_addr() {
        let smtp = SmtpConfig {
            ip: "::1".to_string(),
            port: 25,
            ..SmtpConfig::default()
        };
        assert_eq!(smtp.bind_addr(), "[::1]:25");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[general]\nlog_level = \"debug\"").expect("write");
        let cfg = Config::from_file(file.path()).expect("load");
        assert_eq!(cfg.general.log_level, "debug");
        assert_eq!(cfg.smtp.port, 1025);
    }

    #[test]
    fn test_from_file_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[smtp\nport = ").expect("write");
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_log_dir_override() {
        let mut cfg = Config::default();
        cfg.general.log_dir = Some(PathBuf::from("/tmp/mailsnare-logs"));
        assert_eq!(log_dir(&cfg), PathBuf::from("/tmp/mailsnare-logs"));
    }
}
