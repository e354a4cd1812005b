//! Service configuration loaded from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `REDPANDA_BROKERS` | `localhost:9092` |
//! | `REQUEST_TOPIC` | `request-topic` |
//! | `REPLY_TOPIC` | `reply-topic` |
//! | `CONSUMER_GROUP` | `courier` |
//! | `REPLY_TIMEOUT_MS` | `600000` |
//! | `POOL_CAPACITY` | `3` |
//! | `WORK_LATENCY_MS` | `1000` |
//! | `HTTP_ADDR` | `0.0.0.0:8181` |
//! | `BACKEND_URL` | unset (in-process pool) |
//! | `REPIN_POLICY` | `never` |
//! | `READY_TIMEOUT_MS` | `30000` |

use courier_runtime::{RepinPolicy, WorkerPoolConfig};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        /// Variable name
        key: &'static str,
        /// Raw value
        value: String,
        /// Parser message
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Everything one Courier instance needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Topic requests are published to and consumed from
    pub request_topic: String,
    /// Topic replies are published to; one partition per instance
    pub reply_topic: String,
    /// Consumer group shared by all instances
    pub consumer_group: String,
    /// How long a caller waits for its reply
    pub reply_timeout: Duration,
    /// Worker pool slots
    pub pool_capacity: usize,
    /// Simulated processing time per unit of work
    pub work_latency: Duration,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Remote backend; `None` uses the in-process pool
    pub backend_url: Option<String>,
    /// What to do when the pinned reply partition is revoked
    pub repin_policy: RepinPolicy,
    /// How long startup waits for a reply partition
    pub ready_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            request_topic: "request-topic".to_string(),
            reply_topic: "reply-topic".to_string(),
            consumer_group: "courier".to_string(),
            reply_timeout: Duration::from_secs(600),
            pool_capacity: 3,
            work_latency: Duration::from_secs(1),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8181)),
            backend_url: None,
            repin_policy: RepinPolicy::Never,
            ready_timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    /// Load and validate configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable cannot be parsed or the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load and validate configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: String| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };

        let config = Self {
            brokers: text("REDPANDA_BROKERS", defaults.brokers),
            request_topic: text("REQUEST_TOPIC", defaults.request_topic),
            reply_topic: text("REPLY_TOPIC", defaults.reply_topic),
            consumer_group: text("CONSUMER_GROUP", defaults.consumer_group),
            reply_timeout: millis(&lookup, "REPLY_TIMEOUT_MS")?.unwrap_or(defaults.reply_timeout),
            pool_capacity: parsed(&lookup, "POOL_CAPACITY")?.unwrap_or(defaults.pool_capacity),
            work_latency: millis(&lookup, "WORK_LATENCY_MS")?.unwrap_or(defaults.work_latency),
            http_addr: parsed(&lookup, "HTTP_ADDR")?.unwrap_or(defaults.http_addr),
            backend_url: lookup("BACKEND_URL")
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty()),
            repin_policy: parsed(&lookup, "REPIN_POLICY")?.unwrap_or(defaults.repin_policy),
            ready_timeout: millis(&lookup, "READY_TIMEOUT_MS")?.unwrap_or(defaults.ready_timeout),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::Validation("brokers cannot be empty".to_string()));
        }
        if self.request_topic.is_empty() || self.reply_topic.is_empty() {
            return Err(ConfigError::Validation("topics cannot be empty".to_string()));
        }
        if self.request_topic == self.reply_topic {
            return Err(ConfigError::Validation(format!(
                "request and reply topics must differ (both are {:?})",
                self.request_topic
            )));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::Validation("pool capacity must be > 0".to_string()));
        }
        if self.reply_timeout.is_zero() {
            return Err(ConfigError::Validation("reply timeout must be > 0".to_string()));
        }
        if self.ready_timeout.is_zero() {
            return Err(ConfigError::Validation("ready timeout must be > 0".to_string()));
        }
        if let Some(url) = &self.backend_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Validation(format!(
                    "backend URL must be http(s): {url}"
                )));
            }
        }
        Ok(())
    }

    /// Worker pool settings for the in-process backend.
    #[must_use]
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .capacity(self.pool_capacity)
            .latency(self.work_latency)
    }
}

fn parsed<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_string()) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value: v,
        }),
    }
}

fn millis<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parsed::<u64, F>(lookup, key)?.map(Duration::from_millis))
}
