//! Configuration Module
//!
//! Runtime settings read from `SENTIO_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::client::RetryPolicy;

const DEFAULT_API_URL: &str = "http://127.0.0.1:5001";

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API base URL without trailing slash
    pub api_base_url: String,
    /// Where the token, preferences and logs live
    pub data_dir: PathBuf,
    pub http_timeout: Duration,
    /// Retry policy for identity load and workspace list
    pub retry: RetryPolicy,
    pub refresh_interval: Duration,
    /// Temperature (°C) above which the dashboard raises a warning
    pub temperature_ceiling: f64,
    pub predictions_enabled: bool,
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_base_url = std::env::var("SENTIO_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base_url);

        let data_dir = std::env::var("SENTIO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let http_timeout = env_parse::<u64>("SENTIO_HTTP_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);

        let retry = RetryPolicy {
            max_retries: env_parse::<u32>("SENTIO_RETRY_ATTEMPTS")?
                .unwrap_or(defaults.retry.max_retries),
            base_backoff: env_parse::<u64>("SENTIO_RETRY_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_backoff),
        };

        let refresh_interval = match env_parse::<u64>("SENTIO_REFRESH_SECS")? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    key: "SENTIO_REFRESH_SECS".into(),
                    value: "0".into(),
                })
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.refresh_interval,
        };

        let temperature_ceiling = env_parse::<f64>("SENTIO_TEMPERATURE_CEILING")?
            .unwrap_or(defaults.temperature_ceiling);

        let predictions_enabled = match std::env::var("SENTIO_PREDICTIONS") {
            Ok(value) => parse_flag("SENTIO_PREDICTIONS", &value)?,
            Err(_) => defaults.predictions_enabled,
        };

        Ok(Self {
            api_base_url,
            data_dir,
            http_timeout,
            retry,
            refresh_interval,
            temperature_ceiling,
            predictions_enabled,
        })
    }

    /// Directory for rolling log files
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            data_dir: default_data_dir(),
            http_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            refresh_interval: Duration::from_secs(30),
            temperature_ceiling: 30.0,
            predictions_enabled: true,
        }
    }
}

/// Platform data directory used when `SENTIO_DATA_DIR` is unset
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("SentIO")
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}
