//! Flush hooks.
//!
//! A fixed, ordered list of hooks runs synchronously right before a batch is
//! handed to its fetcher and right after its outcomes were distributed.

use std::time::Duration;

use crate::loader::{EntityType, Key};

// == Flush Report ==
/// Summary of one settled batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub batch_id: u64,
    pub keys: usize,
    /// Keys that resolved to a value
    pub resolved: usize,
    /// Keys that resolved to an error, including batch-wide failures
    pub failed: usize,
    /// Fetcher invocations made for the batch
    pub attempts: u32,
    pub elapsed: Duration,
    /// True when the whole fetch call failed rather than individual keys
    pub batch_failed: bool,
}

// == Flush Hook ==
pub trait FlushHook<K: Key>: Send + Sync {
    fn before_flush(&self, _entity_type: &EntityType, _keys: &[K]) {}

    fn after_flush(&self, _entity_type: &EntityType, _report: &FlushReport) {}
}
