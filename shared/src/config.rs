use std::time::Duration;
use thiserror::Error;

use crate::capabilities::http::{ValidatedUrl, MAX_TIMEOUT_MS};
use crate::model::{ALERTS, WATCHLISTS};
use crate::queue::QueueConfig;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api/v1";

const ENV_API_BASE_URL: &str = "SIGNALHUB_API_BASE_URL";
const ENV_REQUEST_TIMEOUT_MS: &str = "SIGNALHUB_REQUEST_TIMEOUT_MS";
const ENV_MAX_REPLAY_ATTEMPTS: &str = "SIGNALHUB_MAX_REPLAY_ATTEMPTS";
const ENV_RETRY_INTERVAL_MS: &str = "SIGNALHUB_RETRY_INTERVAL_MS";
const ENV_LOG: &str = "SIGNALHUB_LOG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("environment variable {var} has invalid value {value:?}")]
    Env { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    /// Replay failures tolerated before a mutation is surfaced as failed.
    pub max_replay_attempts: u32,
    pub max_queue_entries: usize,
    pub retry_interval_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Shadow collections rehydrated at startup.
    pub shadow_collections: Vec<String>,
    pub user_agent: String,
    /// `EnvFilter` directive; `RUST_LOG` wins when unset.
    pub log_filter: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_ms: 30_000,
            max_replay_attempts: 3,
            max_queue_entries: 10_000,
            retry_interval_ms: 30_000,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            shadow_collections: vec![WATCHLISTS.to_string(), ALERTS.to_string()],
            user_agent: concat!("signalhub-core/", env!("CARGO_PKG_VERSION")).to_string(),
            log_filter: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        Err(_) => Ok(None),
    }
}

impl CoreConfig {
    /// Defaults overridden by `SIGNALHUB_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = parse_env::<String>(ENV_API_BASE_URL)? {
            config.api_base_url = url;
        }
        if let Some(ms) = parse_env(ENV_REQUEST_TIMEOUT_MS)? {
            config.request_timeout_ms = ms;
        }
        if let Some(attempts) = parse_env(ENV_MAX_REPLAY_ATTEMPTS)? {
            config.max_replay_attempts = attempts;
        }
        if let Some(ms) = parse_env(ENV_RETRY_INTERVAL_MS)? {
            config.retry_interval_ms = ms;
        }
        if let Some(filter) = parse_env::<String>(ENV_LOG)? {
            config.log_filter = Some(filter);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ValidatedUrl::new(self.api_base_url.as_str()).map_err(|e| ConfigError::Invalid {
            field: "api_base_url",
            reason: e.to_string(),
        })?;

        let positive = [
            ("request_timeout_ms", self.request_timeout_ms),
            ("max_replay_attempts", u64::from(self.max_replay_attempts)),
            ("max_queue_entries", self.max_queue_entries as u64),
            ("retry_interval_ms", self.retry_interval_ms),
            ("base_backoff_ms", self.base_backoff_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be > 0".into(),
                });
            }
        }

        if self.request_timeout_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                reason: format!("must be <= {MAX_TIMEOUT_MS}"),
            });
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "max_backoff_ms",
                reason: "must be >= base_backoff_ms".into(),
            });
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "user_agent",
                reason: "cannot be empty".into(),
            });
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_entries: self.max_queue_entries,
            max_attempts: self.max_replay_attempts,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
