//! Environment- and CLI-driven configuration, following the same
//! `env::var(...).unwrap_or_else(...)` style the rest of this family of
//! services uses for its settings.

use std::env;
use std::time::Duration;

use crate::error::Error;

pub const DEFAULT_NAMESPACE: &str = "onyx-background";
pub const DEFAULT_QUEUE: &str = "default";

/// Settings shared by the Manager, Worker, Watcher, and status reporter.
#[derive(Clone, Debug)]
pub struct Config {
    pub redis_url: String,
    pub namespace: String,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Ok(Config {
            redis_url: env::var("REDIS_URL")
                .map_err(|_| Error::Config("REDIS_URL is required".into()))?,
            namespace: env::var("ONYX_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string()),
        })
    }

    pub fn with_namespace(redis_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Config {
            redis_url: redis_url.into(),
            namespace: namespace.into(),
        }
    }

    /// Builds the pooled connection handle the Manager, Watcher, and status
    /// reporter use for everything except the Worker's bespoke fiber pool.
    pub fn build_pool(&self) -> Result<deadpool_redis::Pool, Error> {
        deadpool_redis::Config {
            url: Some(self.redis_url.clone()),
            pool: None,
            connection: None,
        }
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| Error::Config(format!("creating redis pool: {}", e)))
    }
}

/// Tunables for a single [`crate::worker::Worker`], defaulted exactly as
/// the defaults below describe.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub fibers: usize,
    pub redis_pool_wait: Duration,
    pub redis_pool_ttl: Duration,
    pub fibers_check_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            fibers: env::var("ONYX_FIBERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            redis_pool_wait: Duration::from_micros(10),
            redis_pool_ttl: Duration::from_secs(30),
            fibers_check_interval: Duration::from_millis(1),
        }
    }
}

/// Tunables for the [`crate::watcher::Watcher`].
#[derive(Clone, Debug)]
pub struct WatcherConfig {
    pub interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            interval: env::var("ONYX_WATCHER_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or_else(|| Duration::from_secs(1)),
        }
    }
}
