//! Mini Loader - A batch-loading and caching engine
//!
//! Collapses keyed lookups ("load the author of each of these posts") into at
//! most one batched fetch per entity type per unit of work, with per-scope
//! result caching, deduplication, bounded concurrency and retries.

pub mod api;
pub mod cache;
pub mod config;
pub mod demo;
pub mod error;
pub mod loader;
pub mod models;
pub mod tasks;

pub use api::AppState;
pub use config::{CacheMode, LoaderConfig, ServerConfig};
pub use error::{ApiError, ApiResult, FetchError, LoadError, Result};
pub use loader::{
    from_fn, EntityType, Engine, EngineBuilder, FetchContext, Fetcher, FlushHook, FlushReport,
    Key, KeyOutcomes, LoadFuture, LoadKey, LoadObserver, LoadStats, Scope, StatsObserver,
    TracingObserver, Value,
};
pub use tasks::spawn_cleanup_task;
