//! Cache Module
//!
//! Result caching for resolved loads: scope-local maps or a shared TTL store
//! with LRU capacity bound.

mod entry;
mod lru;
mod stats;
mod store;


// Re-export public types
pub use entry::{current_timestamp_ms, CacheEntry, Outcome};
pub use lru::LruTracker;
pub use stats::CacheStats;
pub use store::{CachePolicy, CacheStore, FetchTicket, ResultCache};
