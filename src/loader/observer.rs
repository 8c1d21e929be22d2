//! Observability sink.
//!
//! The engine reports batch flushes, cache hits and misses, fetch latency,
//! retries and errors to every attached [`LoadObserver`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{FetchError, LoadError};
use crate::loader::EntityType;

// == Observer Trait ==
/// Receives engine events. Every method defaults to a no-op.
pub trait LoadObserver: Send + Sync {
    fn batch_flushed(&self, _entity_type: &EntityType, _size: usize) {}

    fn cache_hit(&self, _entity_type: &EntityType) {}

    fn cache_miss(&self, _entity_type: &EntityType) {}

    fn fetch_latency(&self, _entity_type: &EntityType, _elapsed: Duration) {}

    fn retried(&self, _entity_type: &EntityType, _attempt: u32, _error: &FetchError) {}

    fn load_failed(&self, _entity_type: &EntityType, _error: &LoadError) {}
}

// == Tracing Observer ==
/// Emits every event as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LoadObserver for TracingObserver {
    fn batch_flushed(&self, entity_type: &EntityType, size: usize) {
        debug!(entity_type = %entity_type, size, "batch flushed");
    }

    fn cache_hit(&self, entity_type: &EntityType) {
        trace!(entity_type = %entity_type, "cache hit");
    }

    fn cache_miss(&self, entity_type: &EntityType) {
        trace!(entity_type = %entity_type, "cache miss");
    }

    fn fetch_latency(&self, entity_type: &EntityType, elapsed: Duration) {
        debug!(
            entity_type = %entity_type,
            elapsed_ms = elapsed.as_millis() as u64,
            "fetch completed"
        );
    }

    fn retried(&self, entity_type: &EntityType, attempt: u32, error: &FetchError) {
        warn!(entity_type = %entity_type, attempt, error = %error, "retrying fetch");
    }

    fn load_failed(&self, entity_type: &EntityType, error: &LoadError) {
        debug!(entity_type = %entity_type, error = %error, "load failed");
    }
}

// == Stats Observer ==
/// Snapshot of the counters kept by [`StatsObserver`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadStats {
    pub batches_flushed: u64,
    pub keys_fetched: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fetches_completed: u64,
    pub total_fetch_latency_ms: u64,
    pub retries: u64,
    pub errors: u64,
}

impl LoadStats {
    /// Mean fetch latency in milliseconds, 0.0 before the first fetch.
    pub fn mean_fetch_latency_ms(&self) -> f64 {
        if self.fetches_completed == 0 {
            0.0
        } else {
            self.total_fetch_latency_ms as f64 / self.fetches_completed as f64
        }
    }
}

/// Lock-free counters over all engine events.
#[derive(Debug, Default)]
pub struct StatsObserver {
    batches_flushed: AtomicU64,
    keys_fetched: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fetches_completed: AtomicU64,
    total_fetch_latency_ms: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
}

impl StatsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> LoadStats {
        LoadStats {
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            keys_fetched: self.keys_fetched.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            fetches_completed: self.fetches_completed.load(Ordering::Relaxed),
            total_fetch_latency_ms: self.total_fetch_latency_ms.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl LoadObserver for StatsObserver {
    fn batch_flushed(&self, _entity_type: &EntityType, size: usize) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.keys_fetched.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn cache_hit(&self, _entity_type: &EntityType) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_miss(&self, _entity_type: &EntityType) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn fetch_latency(&self, _entity_type: &EntityType, elapsed: Duration) {
        self.fetches_completed.fetch_add(1, Ordering::Relaxed);
        self.total_fetch_latency_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn retried(&self, _entity_type: &EntityType, _attempt: u32, _error: &FetchError) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn load_failed(&self, _entity_type: &EntityType, _error: &LoadError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

// == Observer List ==
/// Fan-out over the observers attached to an engine.
#[derive(Clone, Default)]
pub(crate) struct Observers(Vec<Arc<dyn LoadObserver>>);

impl Observers {
    pub(crate) fn new(observers: Vec<Arc<dyn LoadObserver>>) -> Self {
        Self(observers)
    }

    pub(crate) fn batch_flushed(&self, entity_type: &EntityType, size: usize) {
        self.0.iter().for_each(|o| o.batch_flushed(entity_type, size));
    }

    pub(crate) fn cache_hit(&self, entity_type: &EntityType) {
        self.0.iter().for_each(|o| o.cache_hit(entity_type));
    }

    pub(crate) fn cache_miss(&self, entity_type: &EntityType) {
        self.0.iter().for_each(|o| o.cache_miss(entity_type));
    }

    pub(crate) fn fetch_latency(&self, entity_type: &EntityType, elapsed: Duration) {
        self.0.iter().for_each(|o| o.fetch_latency(entity_type, elapsed));
    }

    pub(crate) fn retried(&self, entity_type: &EntityType, attempt: u32, error: &FetchError) {
        self.0
            .iter()
            .for_each(|o| o.retried(entity_type, attempt, error));
    }

    pub(crate) fn load_failed(&self, entity_type: &EntityType, error: &LoadError) {
        self.0.iter().for_each(|o| o.load_failed(entity_type, error));
    }
}
