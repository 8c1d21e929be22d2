//! Loader Module
//!
//! Batching, deduplication, concurrency limiting and retries for keyed loads.
//! An [`Engine`] opens [`Scope`]s; every `load()` within a scope joins the open
//! batch of its entity type, which is flushed to the registered [`Fetcher`]
//! once the current step of work has issued all its loads.

mod batcher;
mod engine;
mod fetcher;
mod future;
mod hooks;
mod key;
mod limiter;
mod observer;
mod retry;
mod scope;


// Re-export public types
pub use batcher::{Batch, BatchState, Enqueued, KeyBatcher};
pub use engine::{Engine, EngineBuilder};
pub use fetcher::{from_fn, FetchContext, Fetcher, FnFetcher, KeyOutcomes};
pub use future::LoadFuture;
pub use hooks::{FlushHook, FlushReport};
pub use key::{EntityType, Key, LoadKey, Value};
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use observer::{LoadObserver, LoadStats, StatsObserver, TracingObserver};
pub use retry::{RetryOutcome, RetryPolicy};
pub use scope::Scope;
