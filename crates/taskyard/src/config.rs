//! Toolkit configuration
//!
//! Groups the per-component configurations and loads them from the
//! environment. Components can also be configured directly through their own
//! builders.

use std::env;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatcherConfig;
use crate::reliability::RetryPolicy;
use crate::worker::WorkerPoolConfig;

/// Configuration for every component, usually loaded once at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolkitConfig {
    /// Worker pool settings
    #[serde(default)]
    pub pool: WorkerPoolConfig,

    /// Batcher settings
    #[serde(default)]
    pub batcher: BatcherConfig,

    /// Retry settings
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ToolkitConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASKYARD_MAX_WORKERS`: pool ceiling (default: logical core count)
    /// - `TASKYARD_POOL_POLL_INTERVAL_MS`: `wait_all` poll interval (default: 10)
    /// - `TASKYARD_BATCH_SIZE`: items per batch (default: 10)
    /// - `TASKYARD_MAX_CONCURRENT_BATCHES`: simultaneous batches (default: logical core count)
    /// - `TASKYARD_RETRY_MAX_ATTEMPTS`: attempts including the first (default: 3)
    /// - `TASKYARD_RETRY_INITIAL_DELAY_MS`: delay before the first retry (default: 100)
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let pool = defaults
            .pool
            .with_max_workers(env_or("TASKYARD_MAX_WORKERS", available_parallelism()))
            .with_poll_interval(Duration::from_millis(env_or(
                "TASKYARD_POOL_POLL_INTERVAL_MS",
                10,
            )));

        let batcher = BatcherConfig::new(
            env_or("TASKYARD_BATCH_SIZE", defaults.batcher.batch_size),
            env_or(
                "TASKYARD_MAX_CONCURRENT_BATCHES",
                defaults.batcher.max_concurrent_batches,
            ),
        );

        let retry = defaults
            .retry
            .with_max_attempts(env_or(
                "TASKYARD_RETRY_MAX_ATTEMPTS",
                RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            ))
            .with_initial_interval(Duration::from_millis(env_or(
                "TASKYARD_RETRY_INITIAL_DELAY_MS",
                RetryPolicy::DEFAULT_INITIAL_INTERVAL.as_millis() as u64,
            )));

        Self {
            pool,
            batcher,
            retry,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Logical core count of the host, at least 1
pub(crate) fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
