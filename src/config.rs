//! Configuration loader and validator for the dutysync engine daemon.
use crate::db::RetryPolicy;
use crate::service::SyncOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub sync: Sync,
    pub api: Api,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Connectivity debounce window in milliseconds.
    pub settle_window_ms: u64,
    /// Cadence of the reachability probe.
    pub probe_interval_ms: u64,
}

/// Retry and backoff settings for queue replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sync {
    pub max_attempts: i32,
    pub base_backoff_secs: i64,
    pub max_backoff_secs: i64,
}

/// Club API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub base_url: String,
    pub token: String,
    pub health_path: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            settle_window: Duration::from_millis(self.app.settle_window_ms),
            retry: RetryPolicy {
                max_attempts: self.sync.max_attempts,
                base_delay_secs: self.sync.base_backoff_secs,
                max_backoff_secs: self.sync.max_backoff_secs,
            },
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.settle_window_ms == 0 {
        return Err(ConfigError::Invalid("app.settle_window_ms must be > 0"));
    }
    if cfg.app.probe_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.probe_interval_ms must be > 0"));
    }

    if cfg.sync.max_attempts <= 0 {
        return Err(ConfigError::Invalid("sync.max_attempts must be > 0"));
    }
    if cfg.sync.base_backoff_secs <= 0 {
        return Err(ConfigError::Invalid("sync.base_backoff_secs must be > 0"));
    }
    if cfg.sync.max_backoff_secs < cfg.sync.base_backoff_secs {
        return Err(ConfigError::Invalid(
            "sync.max_backoff_secs must be >= sync.base_backoff_secs",
        ));
    }

    if cfg.api.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("api.base_url must be non-empty"));
    }
    if cfg.api.token.trim().is_empty() {
        return Err(ConfigError::Invalid("api.token must be non-empty"));
    }
    if cfg.api.health_path.trim().is_empty() {
        return Err(ConfigError::Invalid("api.health_path must be non-empty"));
    }

    Ok(())
}

/// Example configuration shipped with the daemon.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  settle_window_ms: 750
  probe_interval_ms: 5000

sync:
  max_attempts: 5
  base_backoff_secs: 5
  max_backoff_secs: 3600

api:
  base_url: "https://club.example.edu/api/"
  token: "YOUR_API_TOKEN"
  health_path: "v1/health"
"#
}
