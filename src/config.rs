//! Configuration Module
//!
//! Loader tuning knobs, loadable from environment variables or any serde
//! source, plus the demo server's own settings.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};

// == Cache Mode ==
/// Where resolved outcomes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// One plain map per scope, dropped at scope close
    #[default]
    Scoped,
    /// One TTL cache shared by every scope of an engine
    SharedTtl,
}

impl FromStr for CacheMode {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scoped" => Ok(CacheMode::Scoped),
            "shared-ttl" | "shared_ttl" | "shared" => Ok(CacheMode::SharedTtl),
            other => Err(LoadError::InvalidConfig(format!(
                "unknown cache mode '{}'",
                other
            ))),
        }
    }
}

// == Retry Config ==
/// Retry settings for a single batch fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for every further attempt
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay
    pub max_delay_ms: u64,
    /// Random extra delay as a fraction of the computed delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 2000,
            jitter: 0.2,
        }
    }
}

// == Cache Config ==
/// Result cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub mode: CacheMode,
    /// Entry lifetime in shared mode
    pub ttl_ms: u64,
    /// Separate lifetime for cached errors in shared mode, falls back to `ttl_ms`
    pub error_ttl_ms: Option<u64>,
    /// Capacity of the shared cache before LRU eviction kicks in
    pub max_entries: usize,
    /// Interval of the background expiry sweep
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Scoped,
            ttl_ms: 60_000,
            error_ttl_ms: None,
            max_entries: 10_000,
            cleanup_interval_ms: 1000,
        }
    }
}

// == Loader Config ==
/// Engine configuration.
///
/// Field names serialize in camelCase, so a JSON document such as
/// `{"maxBatchSize": 50, "cache": {"mode": "shared-ttl", "ttlMs": 1000}}`
/// deserializes directly; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoaderConfig {
    /// A batch reaching this many keys is flushed immediately
    pub max_batch_size: usize,
    /// Global bound on simultaneous fetch calls, 0 = unbounded
    pub max_concurrent_fetches: usize,
    /// Per entity type bound on simultaneous fetch calls
    pub per_entity_concurrency: HashMap<String, usize>,
    /// Timeout of a single fetch attempt, 0 = no timeout
    pub fetch_timeout_ms: u64,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_concurrent_fetches: 10,
            per_entity_concurrency: HashMap::new(),
            fetch_timeout_ms: 5000,
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl LoaderConfig {
    /// Creates a new LoaderConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `MAX_BATCH_SIZE` (default: 100)
    /// - `MAX_CONCURRENT_FETCHES` (default: 10)
    /// - `FETCH_TIMEOUT_MS` (default: 5000)
    /// - `RETRY_MAX_ATTEMPTS` (default: 3)
    /// - `RETRY_BASE_DELAY_MS` (default: 50)
    /// - `RETRY_MAX_DELAY_MS` (default: 2000)
    /// - `RETRY_JITTER` (default: 0.2)
    /// - `CACHE_MODE` - `scoped` or `shared-ttl` (default: scoped)
    /// - `CACHE_TTL_MS` (default: 60000)
    /// - `CACHE_ERROR_TTL_MS` (default: unset)
    /// - `CACHE_MAX_ENTRIES` (default: 10000)
    /// - `CACHE_CLEANUP_INTERVAL_MS` (default: 1000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_batch_size: env_or("MAX_BATCH_SIZE", defaults.max_batch_size),
            max_concurrent_fetches: env_or(
                "MAX_CONCURRENT_FETCHES",
                defaults.max_concurrent_fetches,
            ),
            per_entity_concurrency: HashMap::new(),
            fetch_timeout_ms: env_or("FETCH_TIMEOUT_MS", defaults.fetch_timeout_ms),
            retry: RetryConfig {
                max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
                base_delay_ms: env_or("RETRY_BASE_DELAY_MS", defaults.retry.base_delay_ms),
                max_delay_ms: env_or("RETRY_MAX_DELAY_MS", defaults.retry.max_delay_ms),
                jitter: env_or("RETRY_JITTER", defaults.retry.jitter),
            },
            cache: CacheConfig {
                mode: env_or("CACHE_MODE", defaults.cache.mode),
                ttl_ms: env_or("CACHE_TTL_MS", defaults.cache.ttl_ms),
                error_ttl_ms: env::var("CACHE_ERROR_TTL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok()),
                max_entries: env_or("CACHE_MAX_ENTRIES", defaults.cache.max_entries),
                cleanup_interval_ms: env_or(
                    "CACHE_CLEANUP_INTERVAL_MS",
                    defaults.cache.cleanup_interval_ms,
                ),
            },
        }
    }

    /// Checks the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(LoadError::InvalidConfig(
                "maxBatchSize must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(LoadError::InvalidConfig(
                "retry.maxAttempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(LoadError::InvalidConfig(format!(
                "retry.jitter must be within 0.0..=1.0, got {}",
                self.retry.jitter
            )));
        }
        if self.cache.mode == CacheMode::SharedTtl && self.cache.max_entries == 0 {
            return Err(LoadError::InvalidConfig(
                "cache.maxEntries must be at least 1 in shared-ttl mode".to_string(),
            ));
        }
        Ok(())
    }
}

// == Server Config ==
/// Demo server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP server port
    pub server_port: u16,
}

impl ServerConfig {
    /// Reads `SERVER_PORT` (default: 3000).
    pub fn from_env() -> Self {
        Self {
            server_port: env_or("SERVER_PORT", 3000),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { server_port: 3000 }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
