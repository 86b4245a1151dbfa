use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_path: PathBuf,

    // Tree-update worker
    pub subscription_name: String,
    pub worker_batch_size: usize,
    pub worker_poll_interval: Duration,
    pub worker_retry_backoff: Duration,
    pub consumer_lease: Duration,

    // Feed composition
    pub feed_ceiling: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Database
            database_path: PathBuf::from(env_or_default("DATABASE_PATH", "./data/microblog.sqlite")),

            // Tree-update worker
            subscription_name: env_or_default("SUBSCRIPTION_NAME", "tree-updates"),
            worker_batch_size: parse_env_usize("WORKER_BATCH_SIZE", 20)?,
            worker_poll_interval: Duration::from_secs(parse_env_u64("WORKER_POLL_INTERVAL_SECS", 2)?),
            worker_retry_backoff: Duration::from_secs(parse_env_u64("WORKER_RETRY_BACKOFF_SECS", 5)?),
            consumer_lease: Duration::from_secs(parse_env_u64("CONSUMER_LEASE_SECS", 60)?),

            // Feed composition
            feed_ceiling: parse_env_usize("FEED_CEILING", 100)?,
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscription_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "SUBSCRIPTION_NAME".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        if self.worker_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "WORKER_BATCH_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.feed_ceiling == 0 {
            return Err(ConfigError::InvalidValue {
                name: "FEED_CEILING".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.consumer_lease < self.worker_poll_interval {
            return Err(ConfigError::InvalidValue {
                name: "CONSUMER_LEASE_SECS".to_string(),
                message: "must be at least the worker poll interval".to_string(),
            });
        }
        Ok(())
    }
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}
