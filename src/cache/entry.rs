//! Cache Entry Module
//!
//! A resolved outcome (value or cached error) with its insertion time and
//! optional expiry.

use std::sync::Arc;

use chrono::Utc;

use crate::error::LoadError;

/// Resolved outcome of a key, shared by every waiter and cache reader.
pub type Outcome<V> = std::result::Result<Arc<V>, LoadError>;

// == Cache Entry ==
/// Represents one cached outcome and its metadata.
#[derive(Debug)]
pub struct CacheEntry<V> {
    /// The stored outcome
    pub outcome: Outcome<V>,
    /// Insertion timestamp (Unix milliseconds)
    pub inserted_at: u64,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expires_at: Option<u64>,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            outcome: self.outcome.clone(),
            inserted_at: self.inserted_at,
            expires_at: self.expires_at,
        }
    }
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates a new cache entry with an optional TTL in milliseconds.
    pub fn new(outcome: Outcome<V>, ttl_ms: Option<u64>) -> Self {
        let now = current_timestamp_ms();
        Self {
            outcome,
            inserted_at: now,
            expires_at: ttl_ms.map(|ttl| now.saturating_add(ttl)),
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once the current time is greater than or equal to
    /// its expiration time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    /// Same as [`is_expired`](Self::is_expired) against a caller-supplied clock.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        match self.expires_at {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }

    /// Returns true if the entry holds a cached error.
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    // == Time To Live ==
    /// Returns remaining TTL in milliseconds, or None if no expiration is set.
    pub fn ttl_remaining_ms(&self) -> Option<u64> {
        self.expires_at
            .map(|expires| expires.saturating_sub(current_timestamp_ms()))
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
