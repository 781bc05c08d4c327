//! Configuration loader and validator for the change-notification dispatcher.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
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
    #[serde(default)]
    pub delivery: Delivery,
    pub tracking: Tracking,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Canonical URL of the origin site, sent with every notification.
    pub site_url: String,
    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,
    /// Lease length for the dispatch run-lock. `0` never expires.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
}

/// Outbound delivery knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_valid_response_codes")]
    pub valid_response_codes: Vec<u16>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_redirect_limit")]
    pub redirect_limit: usize,
}

/// Which content types the listener records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tracking {
    pub content_types: BTreeSet<String>,
}

fn default_dispatch_interval_secs() -> u64 {
    15 * 60
}

fn default_lock_lease_secs() -> u64 {
    60 * 60
}

fn default_max_tries() -> u32 {
    2
}

fn default_valid_response_codes() -> Vec<u16> {
    vec![200]
}

fn default_request_timeout_secs() -> u64 {
    7
}

fn default_redirect_limit() -> usize {
    4
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            valid_response_codes: default_valid_response_codes(),
            request_timeout_secs: default_request_timeout_secs(),
            redirect_limit: default_redirect_limit(),
        }
    }
}

impl Delivery {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl App {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn lock_lease(&self) -> Option<Duration> {
        (self.lock_lease_secs > 0).then(|| Duration::from_secs(self.lock_lease_secs))
    }

    /// `data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` wins; otherwise a SQLite file under the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/content-hooks.db", self.app.resolved_data_dir())
        })
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

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    match Url::parse(cfg.app.site_url.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        _ => return Err(ConfigError::Invalid("app.site_url must be an absolute http(s) URL")),
    }
    if cfg.app.dispatch_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.dispatch_interval_secs must be > 0"));
    }

    let d = &cfg.delivery;
    if d.max_tries == 0 {
        return Err(ConfigError::Invalid("delivery.max_tries must be >= 1"));
    }
    if d.valid_response_codes.is_empty() {
        return Err(ConfigError::Invalid("delivery.valid_response_codes must be non-empty"));
    }
    if d
        .valid_response_codes
        .iter()
        .any(|code| !(100..=599).contains(code))
    {
        return Err(ConfigError::Invalid(
            "delivery.valid_response_codes must be HTTP status codes",
        ));
    }
    if d.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("delivery.request_timeout_secs must be > 0"));
    }

    if cfg.tracking.content_types.is_empty() {
        return Err(ConfigError::Invalid("tracking.content_types must be non-empty"));
    }
    if cfg
        .tracking
        .content_types
        .iter()
        .any(|t| t.trim().is_empty())
    {
        return Err(ConfigError::Invalid("tracking.content_types entries must be non-empty"));
    }

    Ok(())
}

/// Returns the sample YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  site_url: "https://example.com"
  # How often the dispatch cycle runs.
  dispatch_interval_secs: 900
  # Run-lock lease; 0 keeps a crashed cycle's lock until cleared by hand.
  lock_lease_secs: 3600

delivery:
  max_tries: 2
  valid_response_codes:
    - 200
  request_timeout_secs: 7
  redirect_limit: 4

tracking:
  content_types:
    - post
    - page
"#
}
