//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/beacon/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/beacon/` (~/.config/beacon/)
//! - Data: `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
//! - State/Logs: `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)

use crate::error::{Error, Result};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name shared by the daily log files, before the date suffix
pub const LOG_FILE_PREFIX: &str = "beacon.log";

/// Collector used when `app.api_server` is not set.
pub const DEFAULT_API_SERVER: &str = "https://analytics.ionic.io";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Application identity and collector credentials
    #[serde(default)]
    pub app: AppConfig,

    /// Dispatch timing
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Durable store location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Application identity
///
/// The app id scopes every persisted key and the collector endpoint;
/// the write key is sent verbatim in the `Authorization` header.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Application identifier
    pub app_id: Option<String>,

    /// Write credential for the collector
    pub api_write_key: Option<String>,

    /// Collector base URL
    #[serde(default = "default_api_server")]
    pub api_server: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            api_write_key: None,
            api_server: default_api_server(),
        }
    }
}

fn default_api_server() -> String {
    DEFAULT_API_SERVER.to_string()
}

impl AppConfig {
    /// Check if identity and credentials are both present
    pub fn is_ready(&self) -> bool {
        self.app_id.as_deref().is_some_and(|id| !id.is_empty())
            && self.api_write_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.app_id.as_deref().map_or(true, str::is_empty) {
            return Err(Error::Config(
                "app.app_id is required before tracking telemetry".to_string(),
            ));
        }
        if self.api_write_key.as_deref().map_or(true, str::is_empty) {
            return Err(Error::Config(
                "app.api_write_key is required before sending telemetry".to_string(),
            ));
        }
        if !(self.api_server.starts_with("http://") || self.api_server.starts_with("https://")) {
            return Err(Error::Config(format!(
                "app.api_server must be an http(s) URL, got {:?}",
                self.api_server
            )));
        }
        Ok(())
    }

    /// Returns the validated app id
    pub fn require_app_id(&self) -> Result<&str> {
        self.app_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Config("app.app_id is required".to_string()))
    }
}

/// Dispatch scheduling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Seconds between periodic dispatches; zero or negative disables
    /// periodic dispatch and queues nothing (events are sent directly)
    #[serde(default = "default_dispatch_interval")]
    pub interval_secs: i64,

    /// Seconds to wait before the first dispatch after start
    #[serde(default)]
    pub initial_delay_secs: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_dispatch_interval(),
            initial_delay_secs: 0,
            timeout_secs: default_dispatch_timeout(),
        }
    }
}

impl DispatchConfig {
    /// Periodic interval, or `None` when periodic dispatch is disabled
    pub fn interval(&self) -> Option<Duration> {
        interval_from_secs(self.interval_secs)
    }

    /// Delay before the first dispatch
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    /// Request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Convert a signed seconds setting into an optional period
pub fn interval_from_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs)
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

fn default_dispatch_interval() -> i64 {
    30
}

fn default_dispatch_timeout() -> u64 {
    30
}

/// Durable store configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StorageConfig {
    /// Override for the SQLite store file
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the store file path, honoring `storage.path`
    pub fn store_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(Self::default_store_path)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/beacon/config.toml` (~/.config/beacon/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("beacon").join("config.toml")
    }

    /// Returns the data directory path (for the durable store)
    ///
    /// `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("beacon")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("beacon")
    }

    /// Returns the default store file path
    ///
    /// `$XDG_DATA_HOME/beacon/store.db` (~/.local/share/beacon/store.db)
    pub fn default_store_path() -> PathBuf {
        Self::data_dir().join("store.db")
    }

    /// Returns the path of today's log file
    ///
    /// Logs rotate daily (UTC) into
    /// `$XDG_STATE_HOME/beacon/beacon.log.YYYY-MM-DD`.
    pub fn log_path() -> PathBuf {
        Self::log_path_on(Utc::now().date_naive())
    }

    /// Returns the path of the log file written on `date`
    pub fn log_path_on(date: NaiveDate) -> PathBuf {
        Self::state_dir().join(format!("{}.{}", LOG_FILE_PREFIX, date.format("%Y-%m-%d")))
    }

    /// Sets XDG environment variables so every path helper agrees
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_app() -> AppConfig {
        AppConfig {
            app_id: Some("app-123".to_string()),
            api_write_key: Some("wk_test".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.app.app_id.is_none());
        assert_eq!(config.app.api_server, DEFAULT_API_SERVER);
        assert_eq!(config.dispatch.interval_secs, 30);
        assert_eq!(config.dispatch.initial_delay_secs, 0);
        assert_eq!(config.dispatch.timeout_secs, 30);
        assert_eq!(config.logging.level, "info");
        assert!(!config.app.is_ready());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[app]
app_id = "a1b2c3"
api_write_key = "wk_live_xxxx"
api_server = "https://collector.example.com"

[dispatch]
interval_secs = 10
initial_delay_secs = 2

[storage]
path = "/tmp/beacon-test/store.db"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.app.app_id.as_deref(), Some("a1b2c3"));
        assert_eq!(config.app.api_server, "https://collector.example.com");
        assert_eq!(config.dispatch.interval(), Some(Duration::from_secs(10)));
        assert_eq!(config.dispatch.initial_delay(), Duration::from_secs(2));
        assert_eq!(
            config.store_path(),
            PathBuf::from("/tmp/beacon-test/store.db")
        );
        assert_eq!(config.logging.level, "debug");
        assert!(config.app.is_ready());
    }

    #[test]
    fn test_nonpositive_interval_disables_periodic_dispatch() {
        assert_eq!(interval_from_secs(0), None);
        assert_eq!(interval_from_secs(-5), None);
        assert_eq!(interval_from_secs(1), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_app_config_validation() {
        assert!(ready_app().validate().is_ok());

        let missing_id = AppConfig {
            app_id: None,
            ..ready_app()
        };
        assert!(matches!(missing_id.validate(), Err(Error::Config(_))));

        let empty_key = AppConfig {
            api_write_key: Some(String::new()),
            ..ready_app()
        };
        assert!(matches!(empty_key.validate(), Err(Error::Config(_))));
        assert!(!empty_key.is_ready());

        let bad_server = AppConfig {
            api_server: "ftp://collector".to_string(),
            ..ready_app()
        };
        assert!(bad_server.validate().is_err());
    }

    #[test]
    fn test_load_from_reports_parse_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[app\napp_id = ").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }
}
