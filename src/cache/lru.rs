//! LRU Tracker Module
//!
//! Least Recently Used ordering for the shared cache's capacity bound.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

// == LRU Tracker ==
/// Tracks access order for LRU eviction.
///
/// Every touch stamps the key with a fresh, increasing tick. `by_tick` keeps
/// keys ordered by their last tick, so the oldest entry is its first element.
#[derive(Debug)]
pub struct LruTracker<T> {
    ticks: HashMap<T, u64>,
    by_tick: BTreeMap<u64, T>,
    next_tick: u64,
}

impl<T> Default for LruTracker<T> {
    fn default() -> Self {
        Self {
            ticks: HashMap::new(),
            by_tick: BTreeMap::new(),
            next_tick: 0,
        }
    }
}

impl<T: Hash + Eq + Clone> LruTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a key as most recently used.
    pub fn touch(&mut self, key: &T) {
        let tick = self.next_tick;
        self.next_tick += 1;

        if let Some(previous) = self.ticks.insert(key.clone(), tick) {
            self.by_tick.remove(&previous);
        }
        self.by_tick.insert(tick, key.clone());
    }

    pub fn remove(&mut self, key: &T) {
        if let Some(tick) = self.ticks.remove(key) {
            self.by_tick.remove(&tick);
        }
    }

    // == Evict Oldest ==
    /// Returns and forgets the least recently used key.
    pub fn evict_oldest(&mut self) -> Option<T> {
        let (_, key) = self.by_tick.pop_first()?;
        self.ticks.remove(&key);
        Some(key)
    }

    pub fn peek_oldest(&self) -> Option<&T> {
        self.by_tick.first_key_value().map(|(_, key)| key)
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn contains(&self, key: &T) -> bool {
        self.ticks.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.ticks.clear();
        self.by_tick.clear();
    }
}
