//! Fetcher Module
//!
//! A fetcher resolves one batch of keys of a single entity type against a
//! backing store. It may answer the keys in any order and may leave keys out;
//! the engine re-associates outcomes by key identity.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, Result};
use crate::loader::{ConcurrencyLimiter, EntityType, Key, LimiterPermit, Scope, Value};

/// Per-key outcomes returned by a fetcher, in any order.
pub type KeyOutcomes<K, V> = Vec<(K, std::result::Result<V, FetchError>)>;

// == Fetcher Trait ==
#[async_trait]
pub trait Fetcher<K: Key, V: Value>: Send + Sync {
    /// Resolves a deduplicated batch of keys.
    ///
    /// An `Err` fails every key of the batch. A key missing from the returned
    /// outcomes resolves to `KeyNotFound`.
    async fn fetch(
        &self,
        ctx: &FetchContext<K, V>,
        keys: &[K],
    ) -> std::result::Result<KeyOutcomes<K, V>, FetchError>;
}

// == Closure Fetcher ==
/// Fetcher built from an async closure over the batch keys.
pub struct FnFetcher<F> {
    f: F,
}

/// Wraps `f` as a [`Fetcher`]. The closure receives an owned copy of the keys.
pub fn from_fn<F>(f: F) -> FnFetcher<F> {
    FnFetcher { f }
}

#[async_trait]
impl<K, V, F, Fut> Fetcher<K, V> for FnFetcher<F>
where
    K: Key,
    V: Value,
    F: Fn(Vec<K>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<KeyOutcomes<K, V>, FetchError>> + Send,
{
    async fn fetch(
        &self,
        _ctx: &FetchContext<K, V>,
        keys: &[K],
    ) -> std::result::Result<KeyOutcomes<K, V>, FetchError> {
        (self.f)(keys.to_vec()).await
    }
}

// == Fetch Context ==
/// Handed to a fetcher for each attempt.
///
/// Gives access to the scope's cancellation signal and lets the fetcher load
/// dependent records through the same scope. While such a nested load is
/// awaited the fetch gives up its concurrency slot, so a chain of dependent
/// loads cannot exhaust the limiter and wait on itself.
pub struct FetchContext<K: Key, V: Value> {
    entity_type: EntityType,
    batch_id: u64,
    attempt: u32,
    scope: Scope<K, V>,
    cancel: CancellationToken,
    slot: Arc<Mutex<Option<LimiterPermit>>>,
    limiter: Arc<ConcurrencyLimiter>,
}

impl<K: Key, V: Value> FetchContext<K, V> {
    pub(crate) fn new(
        entity_type: EntityType,
        batch_id: u64,
        attempt: u32,
        scope: Scope<K, V>,
        slot: Arc<Mutex<Option<LimiterPermit>>>,
        limiter: Arc<ConcurrencyLimiter>,
    ) -> Self {
        let cancel = scope.cancellation_token();
        Self {
            entity_type,
            batch_id,
            attempt,
            scope,
            cancel,
            slot,
            limiter,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the owning scope is closed.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // == Nested Loads ==
    /// Loads a record of any registered entity type through the owning scope.
    pub async fn load(&self, entity_type: impl Into<EntityType>, key: K) -> Result<Arc<V>> {
        let future = self.scope.load(entity_type, key)?;
        self.without_slot(future).await
    }

    /// Loads several records through the owning scope, in input order.
    pub async fn load_many<I>(
        &self,
        entity_type: impl Into<EntityType>,
        keys: I,
    ) -> Result<Vec<Arc<V>>>
    where
        I: IntoIterator<Item = K>,
    {
        let future = self.scope.load_many(entity_type, keys)?;
        self.without_slot(future).await
    }

    async fn without_slot<F: Future>(&self, future: F) -> F::Output {
        let held = self.slot.lock().take().is_some();
        let output = future.await;
        if held {
            let permit = self.limiter.acquire(&self.entity_type).await;
            *self.slot.lock() = Some(permit);
        }
        output
    }
}
