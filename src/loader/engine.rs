//! Engine Module
//!
//! The engine holds everything shared by the scopes it opens: the fetcher
//! registry, the concurrency limiter, the retry policy, the observers and
//! hooks and, in shared-TTL mode, the result cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CachePolicy, CacheStats, ResultCache};
use crate::config::{CacheMode, LoaderConfig};
use crate::error::{LoadError, Result};
use crate::loader::observer::Observers;
use crate::loader::{
    ConcurrencyLimiter, EntityType, Fetcher, FlushHook, Key, LoadKey, LoadObserver, RetryPolicy,
    Scope, Value,
};
use crate::tasks::spawn_cleanup_task;

pub(crate) struct EngineShared<K: Key, V: Value> {
    pub(crate) config: LoaderConfig,
    pub(crate) registry: HashMap<EntityType, Arc<dyn Fetcher<K, V>>>,
    pub(crate) limiter: Arc<ConcurrencyLimiter>,
    pub(crate) retry: RetryPolicy,
    pub(crate) shared_cache: Option<Arc<ResultCache<K, V>>>,
    pub(crate) observers: Observers,
    pub(crate) hooks: Vec<Arc<dyn FlushHook<K>>>,
    next_scope_id: AtomicU64,
}

// == Engine ==
/// Batch-loading engine. Cheap to clone.
///
/// ```no_run
/// # async fn demo() -> mini_loader::Result<()> {
/// use mini_loader::{from_fn, Engine, FetchError, KeyOutcomes, LoaderConfig};
///
/// let engine: Engine<u64, String> = Engine::builder(LoaderConfig::default())
///     .register(
///         "User",
///         from_fn(|ids: Vec<u64>| async move {
///             let outcomes: KeyOutcomes<u64, String> = ids
///                 .into_iter()
///                 .map(|id| (id, Ok(format!("user {id}"))))
///                 .collect();
///             Ok::<_, FetchError>(outcomes)
///         }),
///     )
///     .build()?;
///
/// let scope = engine.open();
/// let (a, b) = tokio::join!(scope.load("User", 1)?, scope.load("User", 2)?);
/// assert_eq!(a?.as_str(), "user 1");
/// assert_eq!(b?.as_str(), "user 2");
/// scope.close();
/// # Ok(())
/// # }
/// ```
pub struct Engine<K: Key, V: Value> {
    shared: Arc<EngineShared<K, V>>,
}

impl<K: Key, V: Value> Clone for Engine<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K: Key, V: Value> Engine<K, V> {
    pub fn builder(config: LoaderConfig) -> EngineBuilder<K, V> {
        EngineBuilder::new(config)
    }

    /// Opens a new unit of work.
    pub fn open(&self) -> Scope<K, V> {
        let id = self.shared.next_scope_id.fetch_add(1, Ordering::Relaxed);
        let cache = match &self.shared.shared_cache {
            Some(cache) => cache.clone(),
            None => Arc::new(ResultCache::new(CachePolicy::scoped())),
        };
        debug!(scope = id, "scope opened");
        Scope::new(id, self.shared.clone(), cache)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.shared.config
    }

    /// Registered entity types, sorted by name.
    pub fn entity_types(&self) -> Vec<EntityType> {
        let mut types: Vec<EntityType> = self.shared.registry.keys().cloned().collect();
        types.sort();
        types
    }

    /// The cache shared by all scopes, None in scoped mode.
    pub fn shared_cache(&self) -> Option<&Arc<ResultCache<K, V>>> {
        self.shared.shared_cache.as_ref()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.shared.shared_cache.as_ref().map(|cache| cache.stats())
    }

    /// Drops one key from the shared cache. Always false in scoped mode,
    /// where invalidation goes through [`Scope::clear_key`].
    pub fn clear_key(&self, entity_type: impl Into<EntityType>, key: K) -> bool {
        self.shared
            .shared_cache
            .as_ref()
            .is_some_and(|cache| cache.remove(&LoadKey::new(entity_type, key)))
    }

    pub fn clear_all(&self) {
        if let Some(cache) = &self.shared.shared_cache {
            cache.clear();
        }
    }

    /// Starts periodic eviction of expired shared-cache entries. None in
    /// scoped mode, where caches die with their scope.
    pub fn spawn_cleanup_task(&self) -> Option<JoinHandle<()>> {
        let cache = self.shared.shared_cache.clone()?;
        let interval = Duration::from_millis(self.shared.config.cache.cleanup_interval_ms);
        Some(spawn_cleanup_task(cache, interval))
    }
}

// == Builder ==
pub struct EngineBuilder<K: Key, V: Value> {
    config: LoaderConfig,
    registry: HashMap<EntityType, Arc<dyn Fetcher<K, V>>>,
    duplicates: Vec<EntityType>,
    observers: Vec<Arc<dyn LoadObserver>>,
    hooks: Vec<Arc<dyn FlushHook<K>>>,
}

impl<K: Key, V: Value> EngineBuilder<K, V> {
    fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            registry: HashMap::new(),
            duplicates: Vec::new(),
            observers: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Registers the fetcher for an entity type.
    pub fn register<F>(self, entity_type: impl Into<EntityType>, fetcher: F) -> Self
    where
        F: Fetcher<K, V> + 'static,
    {
        self.register_arc(entity_type, Arc::new(fetcher))
    }

    pub fn register_arc(
        mut self,
        entity_type: impl Into<EntityType>,
        fetcher: Arc<dyn Fetcher<K, V>>,
    ) -> Self {
        let entity_type = entity_type.into();
        if self.registry.insert(entity_type.clone(), fetcher).is_some() {
            self.duplicates.push(entity_type);
        }
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LoadObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Appends a flush hook. Hooks run in the order they were added.
    pub fn hook(mut self, hook: Arc<dyn FlushHook<K>>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self) -> Result<Engine<K, V>> {
        self.config.validate()?;
        if let Some(entity_type) = self.duplicates.first() {
            return Err(LoadError::InvalidConfig(format!(
                "fetcher registered twice for entity type {entity_type}"
            )));
        }

        let config = self.config;
        let shared_cache = match config.cache.mode {
            CacheMode::Scoped => None,
            CacheMode::SharedTtl => Some(Arc::new(ResultCache::new(CachePolicy::from_config(
                &config.cache,
            )))),
        };
        let limiter = ConcurrencyLimiter::new(
            config.max_concurrent_fetches,
            &config.per_entity_concurrency,
        );
        let retry = RetryPolicy::new(&config.retry, config.fetch_timeout_ms);

        info!(
            entity_types = self.registry.len(),
            max_batch_size = config.max_batch_size,
            max_concurrent_fetches = config.max_concurrent_fetches,
            cache_mode = ?config.cache.mode,
            "loader engine built"
        );

        Ok(Engine {
            shared: Arc::new(EngineShared {
                config,
                registry: self.registry,
                limiter: Arc::new(limiter),
                retry,
                shared_cache,
                observers: Observers::new(self.observers),
                hooks: self.hooks,
                next_scope_id: AtomicU64::new(1),
            }),
        })
    }
}
