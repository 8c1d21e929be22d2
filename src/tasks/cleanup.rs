//! TTL Cleanup Task
//!
//! Background task that periodically evicts expired entries from a shared
//! result cache. Expired entries are never served either way; the sweep only
//! returns their memory early.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::ResultCache;
use crate::loader::{Key, Value};

/// Spawns a task that calls `cleanup_expired` on `cache` every `interval`.
///
/// The returned handle is meant to be aborted during graceful shutdown.
///
/// ```ignore
/// let handle = spawn_cleanup_task(cache.clone(), Duration::from_secs(1));
/// // Later, during shutdown:
/// handle.abort();
/// ```
pub fn spawn_cleanup_task<K: Key, V: Value>(
    cache: Arc<ResultCache<K, V>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            "Starting TTL cleanup task"
        );

        loop {
            tokio::time::sleep(interval).await;

            let removed = cache.cleanup_expired();
            if removed > 0 {
                info!("TTL cleanup: removed {} expired entries", removed);
            } else {
                debug!("TTL cleanup: no expired entries found");
            }
        }
    })
}
