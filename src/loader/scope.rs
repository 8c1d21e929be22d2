//! Scope Module
//!
//! A scope is one unit of work (typically one incoming request). It owns the
//! open batches, the keys waiting on them and, in scoped cache mode, its own
//! result cache. Closing a scope cancels everything still outstanding.
//!
//! Lock order is scope state first, then the result cache. No lock is held
//! across an await point.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{join_all, JoinAll};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, FetchTicket, Outcome, ResultCache};
use crate::config::CacheMode;
use crate::error::{FetchError, LoadError, Result};
use crate::loader::batcher::{Batch, BatchState, Enqueued, KeyBatcher};
use crate::loader::engine::EngineShared;
use crate::loader::future::FlushTrigger;
use crate::loader::retry::RetryOutcome;
use crate::loader::{
    EntityType, FetchContext, FlushReport, Key, KeyOutcomes, LimiterPermit, LoadFuture, LoadKey,
    Value,
};

type Waiter<V> = oneshot::Sender<Outcome<V>>;

struct PendingKey<V> {
    batch_id: u64,
    waiters: Vec<Waiter<V>>,
}

// == Scope State ==
struct ScopeState<K: Key, V: Value> {
    closed: bool,
    batcher: KeyBatcher<K>,
    /// Keys queued in an open batch or being fetched, with their waiters
    pending: HashMap<LoadKey<K>, PendingKey<V>>,
    /// Waiters of keys invalidated while their batch was being fetched. They
    /// still receive the outcome but it is not cached.
    detached: HashMap<(u64, LoadKey<K>), Vec<Waiter<V>>>,
    /// Ids of batches handed to a fetcher and not yet settled
    flushing: HashSet<u64>,
}

impl<K: Key, V: Value> ScopeState<K, V> {
    fn new(max_batch_size: usize) -> Self {
        Self {
            closed: false,
            batcher: KeyBatcher::new(max_batch_size),
            pending: HashMap::new(),
            detached: HashMap::new(),
            flushing: HashSet::new(),
        }
    }

    /// Removes the waiters of `load_key` that belong to `batch_id`. The flag
    /// is false when the key was invalidated during the fetch.
    fn take_waiters(&mut self, batch_id: u64, load_key: &LoadKey<K>) -> (Vec<Waiter<V>>, bool) {
        let mut waiters = Vec::new();
        let mut attached = false;

        if self
            .pending
            .get(load_key)
            .is_some_and(|pending| pending.batch_id == batch_id)
        {
            if let Some(pending) = self.pending.remove(load_key) {
                waiters = pending.waiters;
                attached = true;
            }
        }
        if let Some(detached) = self.detached.remove(&(batch_id, load_key.clone())) {
            waiters.extend(detached);
        }

        (waiters, attached)
    }

    fn detach_if_flushing(&mut self, load_key: &LoadKey<K>) {
        let batch_id = match self.pending.get(load_key) {
            Some(pending) if self.flushing.contains(&pending.batch_id) => pending.batch_id,
            _ => return,
        };
        if let Some(pending) = self.pending.remove(load_key) {
            self.detached
                .entry((batch_id, load_key.clone()))
                .or_default()
                .extend(pending.waiters);
        }
    }
}

// == Scope ==
pub(crate) struct ScopeInner<K: Key, V: Value> {
    id: u64,
    engine: Arc<EngineShared<K, V>>,
    cache: Arc<ResultCache<K, V>>,
    cancel: CancellationToken,
    state: Mutex<ScopeState<K, V>>,
}

/// Handle to one unit of work. Cheap to clone; all clones share the same
/// batches, cache and cancellation signal.
pub struct Scope<K: Key, V: Value> {
    inner: Arc<ScopeInner<K, V>>,
}

impl<K: Key, V: Value> Clone for Scope<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Key, V: Value> Scope<K, V> {
    pub(crate) fn new(
        id: u64,
        engine: Arc<EngineShared<K, V>>,
        cache: Arc<ResultCache<K, V>>,
    ) -> Self {
        let state = ScopeState::new(engine.config.max_batch_size);
        Self {
            inner: Arc::new(ScopeInner {
                id,
                engine,
                cache,
                cancel: CancellationToken::new(),
                state: Mutex::new(state),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Token cancelled when the scope closes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Statistics of the cache this scope reads from.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// State of the open batch of an entity type.
    pub fn batch_state(&self, entity_type: impl Into<EntityType>) -> BatchState {
        self.inner.state.lock().batcher.state(&entity_type.into())
    }

    // == Load ==
    /// Requests one record.
    ///
    /// Fails immediately when no fetcher is registered for the entity type or
    /// the scope is closed. Otherwise the returned future settles with the
    /// cached outcome, or with the outcome of the batch the key joined.
    pub fn load(&self, entity_type: impl Into<EntityType>, key: K) -> Result<LoadFuture<K, V>> {
        let entity_type = entity_type.into();
        let engine = &self.inner.engine;
        if !engine.registry.contains_key(&entity_type) {
            return Err(LoadError::UnknownEntityType(entity_type));
        }
        let load_key = LoadKey::new(entity_type.clone(), key);

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(LoadError::Cancelled { entity_type });
        }

        if let Some(outcome) = self.inner.cache.get(&load_key) {
            drop(guard);
            engine.observers.cache_hit(&entity_type);
            return Ok(LoadFuture::ready(entity_type, outcome));
        }

        let (tx, rx) = oneshot::channel();
        if let Some(pending) = state.pending.get_mut(&load_key) {
            // Already queued or in flight: share that outcome
            pending.waiters.push(tx);
            let batch_id = pending.batch_id;
            drop(guard);
            engine.observers.cache_miss(&entity_type);
            return Ok(LoadFuture::waiting(
                entity_type,
                rx,
                Some(self.trigger(batch_id)),
            ));
        }

        let enqueued = state.batcher.enqueue(&entity_type, load_key.key.clone());
        let (batch_id, full) = match enqueued {
            Enqueued::Queued { batch_id } => (batch_id, None),
            Enqueued::Full(batch) => {
                state.flushing.insert(batch.id);
                (batch.id, Some(batch))
            }
        };
        state.pending.insert(
            load_key,
            PendingKey {
                batch_id,
                waiters: vec![tx],
            },
        );
        drop(guard);
        engine.observers.cache_miss(&entity_type);

        match full {
            Some(batch) => {
                debug!(
                    scope = self.inner.id,
                    batch = batch.id,
                    entity_type = %entity_type,
                    "batch reached max size, flushing now"
                );
                tokio::spawn(self.inner.clone().flush(batch));
                Ok(LoadFuture::waiting(entity_type, rx, None))
            }
            None => Ok(LoadFuture::waiting(
                entity_type,
                rx,
                Some(self.trigger(batch_id)),
            )),
        }
    }

    /// Requests several records of one entity type. The future yields the
    /// values in input order, or the first error in input order.
    pub fn load_many<I>(
        &self,
        entity_type: impl Into<EntityType>,
        keys: I,
    ) -> Result<impl std::future::Future<Output = Result<Vec<Arc<V>>>> + Send + 'static>
    where
        I: IntoIterator<Item = K>,
    {
        let futures = self.load_all(entity_type.into(), keys)?;
        Ok(join_all(futures).map(|results: Vec<Result<Arc<V>>>| {
            results.into_iter().collect::<Result<Vec<_>>>()
        }))
    }

    /// Like [`Scope::load_many`] but yields every key's own outcome.
    pub fn load_many_settled<I>(
        &self,
        entity_type: impl Into<EntityType>,
        keys: I,
    ) -> Result<JoinAll<LoadFuture<K, V>>>
    where
        I: IntoIterator<Item = K>,
    {
        Ok(join_all(self.load_all(entity_type.into(), keys)?))
    }

    fn load_all<I>(&self, entity_type: EntityType, keys: I) -> Result<Vec<LoadFuture<K, V>>>
    where
        I: IntoIterator<Item = K>,
    {
        keys.into_iter()
            .map(|key| self.load(&entity_type, key))
            .collect()
    }

    fn trigger(&self, batch_id: u64) -> FlushTrigger<K, V> {
        FlushTrigger {
            scope: self.inner.clone(),
            batch_id,
        }
    }

    // == Prime / Clear ==
    /// Seeds the cache with a known value. Returns false when the key already
    /// had a live entry, which is left untouched.
    pub fn prime_key(&self, entity_type: impl Into<EntityType>, key: K, value: V) -> Result<bool> {
        let entity_type = entity_type.into();
        if !self.inner.engine.registry.contains_key(&entity_type) {
            return Err(LoadError::UnknownEntityType(entity_type));
        }

        let state = self.inner.state.lock();
        if state.closed {
            return Err(LoadError::Cancelled { entity_type });
        }
        Ok(self
            .inner
            .cache
            .prime(LoadKey::new(entity_type, key), Ok(Arc::new(value))))
    }

    /// Drops the cached outcome of one key. A fetch already in flight for the
    /// key still answers its waiters but no longer populates the cache.
    pub fn clear_key(&self, entity_type: impl Into<EntityType>, key: K) -> bool {
        let load_key = LoadKey::new(entity_type, key);
        let mut state = self.inner.state.lock();
        let removed = self.inner.cache.remove(&load_key);
        state.detach_if_flushing(&load_key);
        removed
    }

    /// Drops every cached outcome visible to this scope.
    pub fn clear_all(&self) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        self.inner.cache.clear();

        let in_flight: Vec<LoadKey<K>> = state
            .pending
            .iter()
            .filter(|(_, pending)| state.flushing.contains(&pending.batch_id))
            .map(|(load_key, _)| load_key.clone())
            .collect();
        for load_key in &in_flight {
            state.detach_if_flushing(load_key);
        }
    }

    // == Close ==
    /// Ends the unit of work: pending loads fail with `Cancelled`, in-flight
    /// fetches are signalled to stop and their outcomes are discarded.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        let (pending, detached, dropped, in_flight) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let dropped = state.batcher.clear();
            let in_flight = state.flushing.len();
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.detached),
                dropped,
                in_flight,
            )
        };

        self.inner.cancel.cancel();
        if self.inner.cache.mode() == CacheMode::Scoped {
            self.inner.cache.clear();
        }

        let mut cancelled = 0;
        let waiting = pending
            .into_iter()
            .map(|(load_key, pending)| (load_key.entity_type, pending.waiters))
            .chain(
                detached
                    .into_iter()
                    .map(|((_, load_key), waiters)| (load_key.entity_type, waiters)),
            );
        for (entity_type, waiters) in waiting {
            for waiter in waiters {
                let error = LoadError::Cancelled {
                    entity_type: entity_type.clone(),
                };
                if waiter.send(Err(error)).is_ok() {
                    cancelled += 1;
                }
            }
        }

        if cancelled > 0 || in_flight > 0 {
            info!(
                scope = self.inner.id,
                cancelled,
                unflushed_keys = dropped,
                in_flight_batches = in_flight,
                "scope closed with outstanding loads"
            );
        } else {
            debug!(scope = self.inner.id, "scope closed");
        }
    }
}

// == Flush ==
impl<K: Key, V: Value> ScopeInner<K, V> {
    /// Schedules the flush of an open batch, at most once per batch. The flush
    /// task yields first so that loads issued in the same step still join.
    pub(crate) fn schedule_flush(self: &Arc<Self>, entity_type: &EntityType, batch_id: u64) {
        let scheduled = {
            let mut state = self.state.lock();
            !state.closed && state.batcher.mark_scheduled(entity_type, batch_id)
        };
        if !scheduled {
            return;
        }

        let inner = self.clone();
        let entity_type = entity_type.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;

            let batch = {
                let mut state = inner.state.lock();
                let batch = state.batcher.take(&entity_type, batch_id);
                if let Some(batch) = &batch {
                    state.flushing.insert(batch.id);
                }
                batch
            };
            if let Some(batch) = batch {
                inner.flush(batch).await;
            }
        });
    }

    async fn flush(self: Arc<Self>, batch: Batch<K>) {
        let engine = self.engine.clone();
        let entity_type = batch.entity_type.clone();
        let started = Instant::now();
        let ticket = self.cache.begin_fetch();

        for hook in &engine.hooks {
            hook.before_flush(&entity_type, &batch.keys);
        }
        engine.observers.batch_flushed(&entity_type, batch.len());
        debug!(
            scope = self.id,
            batch = batch.id,
            entity_type = %entity_type,
            size = batch.len(),
            "flushing batch"
        );

        let Some(fetcher) = engine.registry.get(&entity_type).cloned() else {
            let outcome = RetryOutcome {
                result: Err(FetchError::permanent("no fetcher registered")),
                attempts: 0,
            };
            self.settle(batch, outcome, ticket, started);
            return;
        };

        let slot: Arc<Mutex<Option<LimiterPermit>>> = Arc::new(Mutex::new(None));
        let scope = Scope {
            inner: self.clone(),
        };
        let keys = &batch.keys;
        let batch_id = batch.id;

        let fetch = async {
            let permit = engine.limiter.acquire(&entity_type).await;
            *slot.lock() = Some(permit);

            let fetch_started = Instant::now();
            let outcome = engine
                .retry
                .run(
                    |attempt| {
                        let fetcher = fetcher.clone();
                        let slot = slot.clone();
                        let limiter = engine.limiter.clone();
                        let ctx = FetchContext::new(
                            entity_type.clone(),
                            batch_id,
                            attempt,
                            scope.clone(),
                            slot.clone(),
                            limiter.clone(),
                        );
                        async move {
                            // An attempt that timed out during a nested load
                            // is dropped with its slot still lent out
                            let lent_out = slot.lock().is_none();
                            if lent_out {
                                let permit = limiter.acquire(ctx.entity_type()).await;
                                *slot.lock() = Some(permit);
                            }
                            fetcher.fetch(&ctx, keys).await
                        }
                    },
                    |attempt, error| engine.observers.retried(&entity_type, attempt, error),
                )
                .await;

            slot.lock().take();
            engine
                .observers
                .fetch_latency(&entity_type, fetch_started.elapsed());
            outcome
        };

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => None,
            outcome = fetch => Some(outcome),
        };

        match outcome {
            Some(outcome) => self.settle(batch, outcome, ticket, started),
            None => {
                debug!(
                    scope = self.id,
                    batch = batch.id,
                    entity_type = %entity_type,
                    "scope closed during fetch, discarding batch"
                );
                self.state.lock().flushing.remove(&batch.id);
            }
        }
    }

    // == Settle ==
    /// Distributes a fetch outcome to every waiter of the batch and caches
    /// what may be cached. Keys invalidated since the fetch started, in this
    /// scope or any other sharing the cache, are delivered but not cached.
    fn settle(
        &self,
        batch: Batch<K>,
        outcome: RetryOutcome<KeyOutcomes<K, V>>,
        ticket: FetchTicket<K, V>,
        started: Instant,
    ) {
        let entity_type = batch.entity_type.clone();
        let batch_id = batch.id;
        let key_count = batch.len();
        let batch_failed = outcome.result.is_err();
        let mut deliveries: Vec<(Vec<Waiter<V>>, Outcome<V>)> = Vec::with_capacity(key_count);

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.flushing.remove(&batch_id);
            if state.closed {
                debug!(
                    scope = self.id,
                    batch = batch_id,
                    "scope closed before settle, discarding outcome"
                );
                return;
            }

            match outcome.result {
                Ok(outcomes) => {
                    let mut by_key: HashMap<K, std::result::Result<V, FetchError>> =
                        HashMap::with_capacity(outcomes.len());
                    for (key, result) in outcomes {
                        by_key.entry(key).or_insert(result);
                    }

                    for key in batch.keys {
                        let result: Outcome<V> = match by_key.remove(&key) {
                            Some(Ok(value)) => Ok(Arc::new(value)),
                            Some(Err(error)) => Err(LoadError::for_key(
                                entity_type.clone(),
                                key.to_string(),
                                error,
                            )),
                            None => Err(LoadError::KeyNotFound {
                                entity_type: entity_type.clone(),
                                key: key.to_string(),
                            }),
                        };

                        let load_key = LoadKey::new(entity_type.clone(), key);
                        let (waiters, attached) = state.take_waiters(batch_id, &load_key);
                        let cacheable = match &result {
                            Ok(_) => true,
                            Err(error) => error.is_cacheable(),
                        };
                        if attached && cacheable {
                            self.cache
                                .insert_fetched(load_key, result.clone(), &ticket);
                        }
                        deliveries.push((waiters, result));
                    }

                    if !by_key.is_empty() {
                        debug!(
                            entity_type = %entity_type,
                            extra = by_key.len(),
                            "fetcher returned keys that were not requested"
                        );
                    }
                }
                Err(source) => {
                    warn!(
                        scope = self.id,
                        batch = batch_id,
                        entity_type = %entity_type,
                        attempts = outcome.attempts,
                        error = %source,
                        "batch fetch failed"
                    );
                    let error = LoadError::BatchFailed {
                        entity_type: entity_type.clone(),
                        keys: batch.keys.iter().map(ToString::to_string).collect(),
                        source,
                    };
                    for key in batch.keys {
                        let load_key = LoadKey::new(entity_type.clone(), key);
                        let (waiters, _) = state.take_waiters(batch_id, &load_key);
                        deliveries.push((waiters, Err(error.clone())));
                    }
                }
            }
        }

        let mut resolved = 0;
        let mut failed = 0;
        for (waiters, result) in deliveries {
            match &result {
                Ok(_) => resolved += 1,
                Err(error) => {
                    failed += 1;
                    self.engine.observers.load_failed(&entity_type, error);
                }
            }
            for waiter in waiters {
                // The caller may have dropped its future
                let _ = waiter.send(result.clone());
            }
        }

        let report = FlushReport {
            batch_id,
            keys: key_count,
            resolved,
            failed,
            attempts: outcome.attempts,
            elapsed: started.elapsed(),
            batch_failed,
        };
        for hook in &self.engine.hooks {
            hook.after_flush(&entity_type, &report);
        }
    }
}
