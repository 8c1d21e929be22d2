//! Cache Store Module
//!
//! Result storage keyed by (entity type, key). In scoped mode it is a plain
//! first-writer-wins map; in shared mode entries carry a TTL, expire lazily on
//! read, are bounded by an LRU capacity and follow last-writer-wins.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{CacheEntry, CacheStats, LruTracker, Outcome};
use crate::config::{CacheConfig, CacheMode};
use crate::loader::{Key, LoadKey};

// == Cache Policy ==
/// How a store treats lifetimes, capacity and concurrent writers.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub mode: CacheMode,
    /// TTL applied to values (shared mode only)
    pub ttl_ms: Option<u64>,
    /// TTL applied to cached errors, defaults to `ttl_ms`
    pub error_ttl_ms: Option<u64>,
    /// Capacity bound (shared mode only)
    pub max_entries: Option<usize>,
}

impl CachePolicy {
    /// Unbounded, non-expiring, first-writer-wins.
    pub fn scoped() -> Self {
        Self {
            mode: CacheMode::Scoped,
            ttl_ms: None,
            error_ttl_ms: None,
            max_entries: None,
        }
    }

    /// TTL-bound, LRU-bounded, last-writer-wins.
    pub fn shared(ttl_ms: u64, error_ttl_ms: Option<u64>, max_entries: usize) -> Self {
        Self {
            mode: CacheMode::SharedTtl,
            ttl_ms: Some(ttl_ms),
            error_ttl_ms: error_ttl_ms.or(Some(ttl_ms)),
            max_entries: Some(max_entries),
        }
    }

    /// Builds the policy for the configured mode.
    pub fn from_config(config: &CacheConfig) -> Self {
        match config.mode {
            CacheMode::Scoped => Self::scoped(),
            CacheMode::SharedTtl => {
                Self::shared(config.ttl_ms, config.error_ttl_ms, config.max_entries)
            }
        }
    }
}

// == Cache Store ==
/// Single-threaded result store. Wrap it in a [`ResultCache`] to share it.
#[derive(Debug)]
pub struct CacheStore<K: Key, V> {
    entries: HashMap<LoadKey<K>, CacheEntry<V>>,
    /// Access order, only maintained when a capacity bound is set
    lru: LruTracker<LoadKey<K>>,
    stats: CacheStats,
    policy: CachePolicy,
    /// Bumped by every invalidation
    generation: u64,
    /// Generation of the last `clear`
    cleared_at: u64,
    /// Generation at which a key was last removed, kept only while fetches
    /// are running
    invalidated: HashMap<LoadKey<K>, u64>,
    running_fetches: usize,
}

impl<K: Key, V> CacheStore<K, V> {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruTracker::new(),
            stats: CacheStats::new(),
            policy,
            generation: 0,
            cleared_at: 0,
            invalidated: HashMap::new(),
            running_fetches: 0,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    // == Get ==
    /// Looks up a key, counting a hit or a miss.
    ///
    /// Expired entries are removed and reported as a miss.
    pub fn get(&mut self, key: &LoadKey<K>) -> Option<Outcome<V>> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                let outcome = entry.outcome.clone();
                self.stats.record_hit();
                if self.policy.max_entries.is_some() {
                    self.lru.touch(key);
                }
                return Some(outcome);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.remove_entry(key);
            self.stats.record_expirations(1);
        }
        self.stats.record_miss();
        None
    }

    /// Returns true if a live entry exists, without touching statistics.
    pub fn contains(&self, key: &LoadKey<K>) -> bool {
        self.entries
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false)
    }

    // == Insert ==
    /// Stores the outcome of a fetch.
    ///
    /// Scoped stores never overwrite a live entry; shared stores let the last
    /// writer win. Returns true if the entry was written.
    pub fn insert(&mut self, key: LoadKey<K>, outcome: Outcome<V>) -> bool {
        if self.policy.mode == CacheMode::Scoped && self.contains(&key) {
            return false;
        }
        self.write(key, outcome);
        true
    }

    // == Prime ==
    /// Seeds an entry unless a live one already exists.
    pub fn prime(&mut self, key: LoadKey<K>, outcome: Outcome<V>) -> bool {
        if self.contains(&key) {
            return false;
        }
        self.write(key, outcome);
        true
    }

    fn write(&mut self, key: LoadKey<K>, outcome: Outcome<V>) {
        let is_overwrite = self.entries.contains_key(&key);

        if let Some(max_entries) = self.policy.max_entries {
            if !is_overwrite && self.entries.len() >= max_entries {
                if let Some(evicted) = self.lru.evict_oldest() {
                    self.entries.remove(&evicted);
                    self.stats.record_eviction();
                }
            }
        }

        let ttl = if outcome.is_ok() {
            self.policy.ttl_ms
        } else {
            self.policy.error_ttl_ms
        };
        if self.policy.max_entries.is_some() {
            self.lru.touch(&key);
        }
        self.entries.insert(key, CacheEntry::new(outcome, ttl));
        self.stats.set_total_entries(self.entries.len());
    }

    // == Remove ==
    /// Invalidates one key. Returns true if an entry was present.
    ///
    /// Fetches that started before the call will not write the key back.
    pub fn remove(&mut self, key: &LoadKey<K>) -> bool {
        self.generation += 1;
        if self.running_fetches > 0 {
            self.invalidated.insert(key.clone(), self.generation);
        }
        self.remove_entry(key)
    }

    fn remove_entry(&mut self, key: &LoadKey<K>) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed && self.policy.max_entries.is_some() {
            self.lru.remove(key);
        }
        self.stats.set_total_entries(self.entries.len());
        removed
    }

    /// Invalidates every entry.
    pub fn clear(&mut self) {
        self.generation += 1;
        self.cleared_at = self.generation;
        self.invalidated.clear();
        self.entries.clear();
        self.lru.clear();
        self.stats.set_total_entries(0);
    }

    // == Fetch Generations ==
    /// Registers a running fetch and returns the generation it started at.
    pub fn begin_fetch(&mut self) -> u64 {
        self.running_fetches += 1;
        self.generation
    }

    pub fn end_fetch(&mut self) {
        self.running_fetches = self.running_fetches.saturating_sub(1);
        if self.running_fetches == 0 {
            self.invalidated.clear();
        }
    }

    /// True if `key` was invalidated after generation `since`.
    pub fn invalidated_since(&self, key: &LoadKey<K>, since: u64) -> bool {
        self.cleared_at > since
            || self
                .invalidated
                .get(key)
                .is_some_and(|generation| *generation > since)
    }

    /// Like [`CacheStore::insert`], but drops the write when the key was
    /// invalidated after generation `since`.
    pub fn insert_since(&mut self, key: LoadKey<K>, outcome: Outcome<V>, since: u64) -> bool {
        if self.invalidated_since(&key, since) {
            return false;
        }
        self.insert(key, outcome)
    }

    // == Cleanup Expired ==
    /// Removes all expired entries, returning how many were dropped.
    pub fn cleanup_expired(&mut self) -> usize {
        let expired_keys: Vec<LoadKey<K>> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        let count = expired_keys.len();
        for key in expired_keys {
            self.remove_entry(&key);
        }
        self.stats.record_expirations(count);
        count
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.set_total_entries(self.entries.len());
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// == Result Cache ==
/// Thread-safe handle over a [`CacheStore`].
///
/// Scopes in scoped mode own a private one; in shared mode every scope of an
/// engine holds the same `Arc<ResultCache>`.
#[derive(Debug)]
pub struct ResultCache<K: Key, V> {
    inner: Mutex<CacheStore<K, V>>,
}

impl<K: Key, V> ResultCache<K, V> {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            inner: Mutex::new(CacheStore::new(policy)),
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.inner.lock().policy().mode
    }

    pub fn get(&self, key: &LoadKey<K>) -> Option<Outcome<V>> {
        self.inner.lock().get(key)
    }

    pub fn insert(&self, key: LoadKey<K>, outcome: Outcome<V>) -> bool {
        self.inner.lock().insert(key, outcome)
    }

    pub fn prime(&self, key: LoadKey<K>, outcome: Outcome<V>) -> bool {
        self.inner.lock().prime(key, outcome)
    }

    pub fn remove(&self, key: &LoadKey<K>) -> bool {
        self.inner.lock().remove(key)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn cleanup_expired(&self) -> usize {
        self.inner.lock().cleanup_expired()
    }

    /// Marks the start of a fetch whose outcomes will be written back. The
    /// ticket ends the fetch when dropped.
    pub fn begin_fetch(self: &Arc<Self>) -> FetchTicket<K, V> {
        let since = self.inner.lock().begin_fetch();
        FetchTicket {
            cache: self.clone(),
            since,
        }
    }

    /// Writes a fetched outcome unless the key was invalidated while the
    /// ticket's fetch was running.
    pub fn insert_fetched(
        &self,
        key: LoadKey<K>,
        outcome: Outcome<V>,
        ticket: &FetchTicket<K, V>,
    ) -> bool {
        self.inner.lock().insert_since(key, outcome, ticket.since)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

// == Fetch Ticket ==
/// Held for the duration of one batch fetch against a [`ResultCache`].
#[derive(Debug)]
pub struct FetchTicket<K: Key, V> {
    cache: Arc<ResultCache<K, V>>,
    since: u64,
}

impl<K: Key, V> FetchTicket<K, V> {
    /// Cache generation at which the fetch started.
    pub fn since(&self) -> u64 {
        self.since
    }
}

impl<K: Key, V> Drop for FetchTicket<K, V> {
    fn drop(&mut self) {
        self.cache.inner.lock().end_fetch();
    }
}
