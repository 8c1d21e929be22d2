//! Engine Behaviour Tests
//!
//! Drives the engine with recording fetchers and asserts batch contents, call
//! counts, caching, limiter timing and cancellation.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use mini_loader::config::CacheMode;
use mini_loader::{
    from_fn, Engine, EntityType, FetchContext, FetchError, Fetcher, FlushHook, FlushReport,
    KeyOutcomes, LoadError, LoadObserver, LoaderConfig, StatsObserver,
};

type Calls = Arc<Mutex<Vec<Vec<u64>>>>;

// == Helper Functions ==

/// Resolves every key to `v{key}` and records each batch.
fn echo_fetcher(calls: Calls) -> impl Fetcher<u64, String> {
    from_fn(move |ids: Vec<u64>| {
        calls.lock().push(ids.clone());
        async move {
            let outcomes: KeyOutcomes<u64, String> = ids
                .into_iter()
                .map(|id| (id, Ok(format!("v{id}"))))
                .collect();
            Ok::<_, FetchError>(outcomes)
        }
    })
}

/// Like `echo_fetcher` but sleeps before answering.
fn slow_fetcher(calls: Calls, delay: Duration) -> impl Fetcher<u64, String> {
    from_fn(move |ids: Vec<u64>| {
        calls.lock().push(ids.clone());
        async move {
            tokio::time::sleep(delay).await;
            let outcomes: KeyOutcomes<u64, String> = ids
                .into_iter()
                .map(|id| (id, Ok(format!("v{id}"))))
                .collect();
            Ok::<_, FetchError>(outcomes)
        }
    })
}

fn fast_retries() -> LoaderConfig {
    let mut config = LoaderConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter = 0.0;
    config
}

fn user_engine(config: LoaderConfig, fetcher: impl Fetcher<u64, String> + 'static) -> Engine<u64, String> {
    Engine::builder(config).register("User", fetcher).build().unwrap()
}

fn total_calls(calls: &Calls) -> usize {
    calls.lock().len()
}

// == Batching ==

#[tokio::test]
async fn test_loads_in_same_step_coalesce_into_one_fetch() {
    let calls = Calls::default();
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(calls.clone()));
    let scope = engine.open();

    let (a, b, c) = tokio::join!(
        scope.load("User", 1).unwrap(),
        scope.load("User", 2).unwrap(),
        scope.load("User", 3).unwrap()
    );

    assert_eq!(a.unwrap().as_str(), "v1");
    assert_eq!(b.unwrap().as_str(), "v2");
    assert_eq!(c.unwrap().as_str(), "v3");
    assert_eq!(*calls.lock(), vec![vec![1, 2, 3]]);
}

#[tokio::test]
async fn test_loads_from_sibling_tasks_share_a_batch() {
    let calls = Calls::default();
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(calls.clone()));
    let scope = engine.open();

    let first = {
        let scope = scope.clone();
        tokio::spawn(async move { scope.load("User", 1).unwrap().await })
    };
    let second = {
        let scope = scope.clone();
        tokio::spawn(async move { scope.load("User", 2).unwrap().await })
    };

    assert_eq!(first.await.unwrap().unwrap().as_str(), "v1");
    assert_eq!(second.await.unwrap().unwrap().as_str(), "v2");
    assert_eq!(*calls.lock(), vec![vec![1, 2]]);
}

#[tokio::test]
async fn test_duplicate_keys_fetch_once_and_share_the_value() {
    let calls = Calls::default();
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(calls.clone()));
    let scope = engine.open();

    let (a, b) = tokio::join!(
        scope.load("User", 7).unwrap(),
        scope.load("User", 7).unwrap()
    );

    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(*calls.lock(), vec![vec![7]]);
}

#[tokio::test]
async fn test_full_batch_flushes_immediately() {
    let calls = Calls::default();
    let config = LoaderConfig {
        max_batch_size: 2,
        ..LoaderConfig::default()
    };
    let engine = user_engine(config, echo_fetcher(calls.clone()));
    let scope = engine.open();

    let values = scope.load_many("User", vec![1, 2, 3, 4, 5]).unwrap().await.unwrap();

    assert_eq!(values.len(), 5);
    let mut batches = calls.lock().clone();
    batches.sort();
    assert_eq!(batches, vec![vec![1, 2], vec![3, 4], vec![5]]);
}

#[tokio::test]
async fn test_batch_state_moves_from_empty_to_open() {
    let calls = Calls::default();
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(calls.clone()));
    let scope = engine.open();

    assert_eq!(scope.batch_state("User"), mini_loader::loader::BatchState::Empty);
    let pending = scope.load("User", 1).unwrap();
    assert!(matches!(
        scope.batch_state("User"),
        mini_loader::loader::BatchState::Open { len: 1, .. }
    ));

    pending.await.unwrap();
    assert_eq!(scope.batch_state("User"), mini_loader::loader::BatchState::Empty);
}

// == Load Many ==

#[tokio::test]
async fn test_load_many_keeps_input_order() {
    let engine = user_engine(
        LoaderConfig::default(),
        from_fn(|ids: Vec<u64>| async move {
            // Answer in reverse order
            let outcomes: KeyOutcomes<u64, String> = ids
                .into_iter()
                .rev()
                .map(|id| (id, Ok(format!("v{id}"))))
                .collect();
            Ok::<_, FetchError>(outcomes)
        }),
    );
    let scope = engine.open();

    let values = scope.load_many("User", vec![3, 1, 2, 1]).unwrap().await.unwrap();
    let values: Vec<&str> = values.iter().map(|v| v.as_str()).collect();

    assert_eq!(values, vec!["v3", "v1", "v2", "v1"]);
}

#[tokio::test]
async fn test_load_many_empty_input_makes_no_calls() {
    let calls = Calls::default();
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(calls.clone()));
    let scope = engine.open();

    let values = scope.load_many("User", Vec::new()).unwrap().await.unwrap();

    assert!(values.is_empty());
    assert_eq!(total_calls(&calls), 0);
}

#[tokio::test]
async fn test_load_many_fails_with_first_error_in_input_order() {
    let engine = user_engine(
        LoaderConfig::default(),
        from_fn(|ids: Vec<u64>| async move {
            let outcomes: KeyOutcomes<u64, String> = ids
                .into_iter()
                .map(|id| match id {
                    2 => (id, Err(FetchError::permanent("forbidden"))),
                    3 => (id, Err(FetchError::NotFound)),
                    _ => (id, Ok(format!("v{id}"))),
                })
                .collect();
            Ok::<_, FetchError>(outcomes)
        }),
    );
    let scope = engine.open();

    let result = scope.load_many("User", vec![1, 3, 2]).unwrap().await;
    assert!(matches!(result, Err(LoadError::KeyNotFound { ref key, .. }) if key == "3"));

    let settled = scope.load_many_settled("User", vec![1, 3, 2]).unwrap().await;
    assert_eq!(settled.len(), 3);
    assert!(settled[0].is_ok());
    assert!(matches!(settled[1], Err(LoadError::KeyNotFound { .. })));
    assert!(matches!(settled[2], Err(LoadError::Permanent { .. })));
}

// == Fetcher Adapter ==

#[tokio::test]
async fn test_omitted_key_resolves_to_not_found() {
    let engine = user_engine(
        LoaderConfig::default(),
        from_fn(|ids: Vec<u64>| async move {
            let outcomes: KeyOutcomes<u64, String> = ids
                .into_iter()
                .filter(|id| *id != 2)
                .map(|id| (id, Ok(format!("v{id}"))))
                .collect();
            Ok::<_, FetchError>(outcomes)
        }),
    );
    let scope = engine.open();

    let (one, two) = tokio::join!(
        scope.load("User", 1).unwrap(),
        scope.load("User", 2).unwrap()
    );

    assert_eq!(one.unwrap().as_str(), "v1");
    assert_eq!(
        two.unwrap_err(),
        LoadError::KeyNotFound {
            entity_type: EntityType::from("User"),
            key: "2".to_string()
        }
    );
}

#[tokio::test]
async fn test_unrequested_keys_are_ignored() {
    let engine = user_engine(
        LoaderConfig::default(),
        from_fn(|ids: Vec<u64>| async move {
            let mut outcomes: KeyOutcomes<u64, String> =
                ids.into_iter().map(|id| (id, Ok(format!("v{id}")))).collect();
            outcomes.push((99, Ok("stray".to_string())));
            Ok::<_, FetchError>(outcomes)
        }),
    );
    let scope = engine.open();

    assert_eq!(scope.load("User", 1).unwrap().await.unwrap().as_str(), "v1");
    assert!(!scope.load("User", 99).unwrap().is_ready());
}

// == Caching ==

#[tokio::test]
async fn test_cache_hit_is_ready_without_fetch() {
    let calls = Calls::default();
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(calls.clone()));
    let scope = engine.open();

    let first = scope.load("User", 1).unwrap().await.unwrap();
    let again = scope.load("User", 1).unwrap();

    assert!(again.is_ready());
    assert!(Arc::ptr_eq(&first, &again.await.unwrap()));
    assert_eq!(total_calls(&calls), 1);
}

#[tokio::test]
async fn test_scoped_caches_are_isolated() {
    let calls = Calls::default();
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(calls.clone()));

    let a = engine.open();
    let b = engine.open();
    a.load("User", 1).unwrap().await.unwrap();
    assert!(!b.load("User", 1).unwrap().is_ready());
    assert!(engine.cache_stats().is_none());
}

#[tokio::test]
async fn test_permanent_key_error_is_cached() {
    let calls = Calls::default();
    let recorded = calls.clone();
    let engine = user_engine(
        LoaderConfig::default(),
        from_fn(move |ids: Vec<u64>| {
            recorded.lock().push(ids.clone());
            async move {
                let outcomes: KeyOutcomes<u64, String> = ids
                    .into_iter()
                    .map(|id| (id, Err(FetchError::permanent("forbidden"))))
                    .collect();
                Ok::<_, FetchError>(outcomes)
            }
        }),
    );
    let scope = engine.open();

    let first = scope.load("User", 1).unwrap().await;
    assert!(matches!(first, Err(LoadError::Permanent { .. })));

    let again = scope.load("User", 1).unwrap();
    assert!(again.is_ready());
    assert_eq!(again.await, first);
    assert_eq!(total_calls(&calls), 1);
}

#[tokio::test]
async fn test_per_key_transient_error_is_not_cached() {
    let calls = Calls::default();
    let recorded = calls.clone();
    let engine = user_engine(
        LoaderConfig::default(),
        from_fn(move |ids: Vec<u64>| {
            recorded.lock().push(ids.clone());
            async move {
                let outcomes: KeyOutcomes<u64, String> = ids
                    .into_iter()
                    .map(|id| (id, Err(FetchError::transient("replica lag"))))
                    .collect();
                Ok::<_, FetchError>(outcomes)
            }
        }),
    );
    let scope = engine.open();

    let first = scope.load("User", 1).unwrap().await;
    assert!(matches!(first, Err(LoadError::Transient { .. })));
    // Per-key errors are answers, the batch itself succeeded
    assert_eq!(total_calls(&calls), 1);

    assert!(!scope.load("User", 1).unwrap().is_ready());
}

#[tokio::test]
async fn test_prime_key_seeds_cache() {
    let calls = Calls::default();
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(calls.clone()));
    let scope = engine.open();

    assert!(scope.prime_key("User", 5, "primed".to_string()).unwrap());
    assert!(!scope.prime_key("User", 5, "other".to_string()).unwrap());

    let value = scope.load("User", 5).unwrap();
    assert!(value.is_ready());
    assert_eq!(value.await.unwrap().as_str(), "primed");
    assert_eq!(total_calls(&calls), 0);

    assert!(matches!(
        scope.prime_key("Comment", 1, "x".to_string()),
        Err(LoadError::UnknownEntityType(_))
    ));
}

#[tokio::test]
async fn test_clear_key_forces_refetch() {
    let calls = Calls::default();
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(calls.clone()));
    let scope = engine.open();

    scope.load("User", 1).unwrap().await.unwrap();
    scope.load("User", 2).unwrap().await.unwrap();

    assert!(scope.clear_key("User", 1));
    assert!(!scope.clear_key("User", 1));
    assert!(!scope.load("User", 1).unwrap().is_ready());
    assert!(scope.load("User", 2).unwrap().is_ready());

    scope.clear_all();
    assert!(!scope.load("User", 2).unwrap().is_ready());
}

#[tokio::test]
async fn test_clear_key_during_flight_skips_cache_write() {
    let calls = Calls::default();
    let engine = user_engine(
        LoaderConfig::default(),
        slow_fetcher(calls.clone(), Duration::from_millis(50)),
    );
    let scope = engine.open();

    let in_flight = tokio::spawn(scope.load("User", 1).unwrap());
    tokio::time::sleep(Duration::from_millis(10)).await;
    scope.clear_key("User", 1);

    // The waiter still gets the in-flight value
    assert_eq!(in_flight.await.unwrap().unwrap().as_str(), "v1");
    // but it was not cached
    let reload = scope.load("User", 1).unwrap();
    assert!(!reload.is_ready());
    reload.await.unwrap();
    assert_eq!(total_calls(&calls), 2);
}

#[tokio::test]
async fn test_shared_ttl_cache_spans_scopes_and_expires() {
    let calls = Calls::default();
    let mut config = LoaderConfig::default();
    config.cache.mode = CacheMode::SharedTtl;
    config.cache.ttl_ms = 50;
    let engine = user_engine(config, echo_fetcher(calls.clone()));

    engine.open().load("User", 1).unwrap().await.unwrap();
    assert!(engine.open().load("User", 1).unwrap().is_ready());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let expired = engine.open().load("User", 1).unwrap();
    assert!(!expired.is_ready());
    expired.await.unwrap();

    assert_eq!(total_calls(&calls), 2);
    let stats = engine.cache_stats().unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.expirations, 1);
}

#[tokio::test]
async fn test_engine_clear_key_on_shared_cache() {
    let calls = Calls::default();
    let mut config = LoaderConfig::default();
    config.cache.mode = CacheMode::SharedTtl;
    let engine = user_engine(config, echo_fetcher(calls.clone()));

    engine.open().load("User", 1).unwrap().await.unwrap();
    assert!(engine.clear_key("User", 1));
    assert!(!engine.open().load("User", 1).unwrap().is_ready());
}

#[tokio::test]
async fn test_engine_clear_key_during_fetch_drops_stale_write() {
    let version = Arc::new(AtomicU32::new(1));
    let mut config = LoaderConfig::default();
    config.cache.mode = CacheMode::SharedTtl;
    let fetcher = {
        let version = version.clone();
        from_fn(move |ids: Vec<u64>| {
            let seen = version.load(Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let outcomes: KeyOutcomes<u64, String> = ids
                    .into_iter()
                    .map(|id| (id, Ok(format!("v{seen}-{id}"))))
                    .collect();
                Ok::<_, FetchError>(outcomes)
            }
        })
    };
    let engine = user_engine(config, fetcher);

    let in_flight = tokio::spawn(engine.open().load("User", 1).unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    version.store(2, Ordering::SeqCst);
    engine.clear_key("User", 1);

    // The running fetch still answers its own caller
    assert_eq!(in_flight.await.unwrap().unwrap().as_str(), "v1-1");

    let reload = engine.open().load("User", 1).unwrap();
    assert!(!reload.is_ready());
    assert_eq!(reload.await.unwrap().as_str(), "v2-1");
}

#[tokio::test]
async fn test_scope_clear_key_reaches_fetch_of_other_scope() {
    let calls = Calls::default();
    let mut config = LoaderConfig::default();
    config.cache.mode = CacheMode::SharedTtl;
    let engine = user_engine(config, slow_fetcher(calls.clone(), Duration::from_millis(60)));

    let writer = engine.open();
    let in_flight = tokio::spawn(engine.open().load("User", 3).unwrap());
    tokio::time::sleep(Duration::from_millis(10)).await;
    writer.clear_key("User", 3);
    in_flight.await.unwrap().unwrap();

    assert!(!engine.open().load("User", 3).unwrap().is_ready());
    assert_eq!(engine.cache_stats().unwrap().total_entries, 0);
}

// == Concurrency Limiter ==

#[tokio::test]
async fn test_global_limit_of_one_serializes_fetches() {
    let spans: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::default();
    let timed = |spans: Arc<Mutex<Vec<(Instant, Instant)>>>| {
        from_fn(move |ids: Vec<u64>| {
            let spans = spans.clone();
            async move {
                let start = Instant::now();
                tokio::time::sleep(Duration::from_millis(40)).await;
                spans.lock().push((start, Instant::now()));
                let outcomes: KeyOutcomes<u64, String> =
                    ids.into_iter().map(|id| (id, Ok(format!("v{id}")))).collect();
                Ok::<_, FetchError>(outcomes)
            }
        })
    };
    let config = LoaderConfig {
        max_concurrent_fetches: 1,
        ..LoaderConfig::default()
    };
    let engine: Engine<u64, String> = Engine::builder(config)
        .register("User", timed(spans.clone()))
        .register("Post", timed(spans.clone()))
        .build()
        .unwrap();
    let scope = engine.open();

    let (user, post) = tokio::join!(
        scope.load("User", 1).unwrap(),
        scope.load("Post", 1).unwrap()
    );
    user.unwrap();
    post.unwrap();

    let mut spans = spans.lock().clone();
    spans.sort();
    assert_eq!(spans.len(), 2);
    assert!(spans[0].1 <= spans[1].0, "fetches overlapped");
}

struct PostsWithAuthors {
    calls: Calls,
}

#[async_trait]
impl Fetcher<u64, String> for PostsWithAuthors {
    async fn fetch(
        &self,
        ctx: &FetchContext<u64, String>,
        keys: &[u64],
    ) -> Result<KeyOutcomes<u64, String>, FetchError> {
        self.calls.lock().push(keys.to_vec());
        let author_ids: Vec<u64> = keys.iter().map(|id| id % 10).collect();
        let authors = ctx
            .load_many("User", author_ids)
            .await
            .map_err(|e| FetchError::permanent(e.to_string()))?;

        Ok(keys
            .iter()
            .zip(authors)
            .map(|(id, author)| (*id, Ok(format!("post {id} by {author}"))))
            .collect())
    }
}

#[tokio::test]
async fn test_nested_loads_do_not_deadlock_under_limit_of_one() {
    let users = Calls::default();
    let posts = Calls::default();
    let config = LoaderConfig {
        max_concurrent_fetches: 1,
        ..LoaderConfig::default()
    };
    let engine: Engine<u64, String> = Engine::builder(config)
        .register("User", echo_fetcher(users.clone()))
        .register(
            "Post",
            PostsWithAuthors {
                calls: posts.clone(),
            },
        )
        .build()
        .unwrap();
    let scope = engine.open();

    let loaded = tokio::time::timeout(
        Duration::from_secs(2),
        scope.load_many("Post", vec![11, 12]).unwrap(),
    )
    .await
    .expect("nested load deadlocked")
    .unwrap();

    assert_eq!(loaded[0].as_str(), "post 11 by v1");
    assert_eq!(loaded[1].as_str(), "post 12 by v2");
    assert_eq!(*users.lock(), vec![vec![1, 2]]);
    assert_eq!(*posts.lock(), vec![vec![11, 12]]);
}

/// Tracks how many fetcher bodies run at once.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

struct Running<'a>(&'a InFlight);

impl InFlight {
    fn enter(&self) -> Running<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        Running(self)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SlowUsers {
    in_flight: Arc<InFlight>,
}

#[async_trait]
impl Fetcher<u64, String> for SlowUsers {
    async fn fetch(
        &self,
        _ctx: &FetchContext<u64, String>,
        keys: &[u64],
    ) -> Result<KeyOutcomes<u64, String>, FetchError> {
        let _running = self.in_flight.enter();
        tokio::time::sleep(Duration::from_millis(90)).await;
        Ok(keys.iter().map(|id| (*id, Ok(format!("user {id}")))).collect())
    }
}

/// First attempt works, then waits on a nested user load past the attempt
/// timeout; the retry does its work directly.
struct PostsTimingOutOnAuthor {
    in_flight: Arc<InFlight>,
}

#[async_trait]
impl Fetcher<u64, String> for PostsTimingOutOnAuthor {
    async fn fetch(
        &self,
        ctx: &FetchContext<u64, String>,
        keys: &[u64],
    ) -> Result<KeyOutcomes<u64, String>, FetchError> {
        if ctx.attempt() == 1 {
            {
                let _running = self.in_flight.enter();
                tokio::time::sleep(Duration::from_millis(60)).await;
            }
            ctx.load("User", 1)
                .await
                .map_err(|e| FetchError::permanent(e.to_string()))?;
        } else {
            let _running = self.in_flight.enter();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        Ok(keys.iter().map(|id| (*id, Ok(format!("post {id}")))).collect())
    }
}

#[tokio::test]
async fn test_retry_after_timeout_in_nested_load_respects_limit() {
    let in_flight = Arc::new(InFlight::default());
    let mut config = fast_retries();
    config.max_concurrent_fetches = 1;
    config.fetch_timeout_ms = 100;
    config.retry.max_attempts = 2;
    let engine: Engine<u64, String> = Engine::builder(config)
        .register(
            "User",
            SlowUsers {
                in_flight: in_flight.clone(),
            },
        )
        .register(
            "Post",
            PostsTimingOutOnAuthor {
                in_flight: in_flight.clone(),
            },
        )
        .build()
        .unwrap();

    let post = engine.open().load("Post", 7).unwrap().await.unwrap();

    assert_eq!(post.as_str(), "post 7");
    assert_eq!(in_flight.max.load(Ordering::SeqCst), 1);
}

// == Retry Policy ==

/// Fails the first `failures` calls with `error`, then echoes.
fn flaky_fetcher(attempts: Arc<AtomicU32>, failures: u32, error: FetchError) -> impl Fetcher<u64, String> {
    from_fn(move |ids: Vec<u64>| {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        let error = error.clone();
        async move {
            if n < failures {
                return Err(error);
            }
            let outcomes: KeyOutcomes<u64, String> =
                ids.into_iter().map(|id| (id, Ok(format!("v{id}")))).collect();
            Ok(outcomes)
        }
    })
}

#[tokio::test]
async fn test_transient_batch_failure_is_retried() {
    let attempts = Arc::new(AtomicU32::new(0));
    let stats = Arc::new(StatsObserver::new());
    let engine: Engine<u64, String> = Engine::builder(fast_retries())
        .register(
            "User",
            flaky_fetcher(attempts.clone(), 2, FetchError::transient("connection reset")),
        )
        .observer(stats.clone() as Arc<dyn LoadObserver>)
        .build()
        .unwrap();

    let value = engine.open().load("User", 1).unwrap().await.unwrap();

    assert_eq!(value.as_str(), "v1");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(stats.snapshot().retries, 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_batch_and_are_not_cached() {
    let attempts = Arc::new(AtomicU32::new(0));
    let engine = user_engine(
        fast_retries(),
        flaky_fetcher(attempts.clone(), 3, FetchError::transient("down")),
    );
    let scope = engine.open();

    let (a, b) = tokio::join!(
        scope.load("User", 1).unwrap(),
        scope.load("User", 2).unwrap()
    );
    match a.unwrap_err() {
        LoadError::BatchFailed { keys, source, .. } => {
            assert_eq!(keys, vec!["1".to_string(), "2".to_string()]);
            assert_eq!(source, FetchError::transient("down"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(b, Err(LoadError::BatchFailed { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // Not cached: the next load fetches again and now succeeds
    let retry = scope.load("User", 1).unwrap();
    assert!(!retry.is_ready());
    assert_eq!(retry.await.unwrap().as_str(), "v1");
}

#[tokio::test]
async fn test_permanent_batch_failure_is_not_retried() {
    let attempts = Arc::new(AtomicU32::new(0));
    let engine = user_engine(
        fast_retries(),
        flaky_fetcher(attempts.clone(), 1, FetchError::permanent("bad query")),
    );

    let result = engine.open().load("User", 1).unwrap().await;

    assert!(matches!(result, Err(LoadError::BatchFailed { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_attempt_timeout_is_retried() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let mut config = fast_retries();
    config.fetch_timeout_ms = 30;
    let engine = user_engine(
        config,
        from_fn(move |ids: Vec<u64>| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                let outcomes: KeyOutcomes<u64, String> =
                    ids.into_iter().map(|id| (id, Ok(format!("v{id}")))).collect();
                Ok::<_, FetchError>(outcomes)
            }
        }),
    );

    let value = engine.open().load("User", 1).unwrap().await.unwrap();

    assert_eq!(value.as_str(), "v1");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

// == Cancellation ==

#[tokio::test]
async fn test_close_during_fetch_cancels_and_skips_cache() {
    let calls = Calls::default();
    let mut config = LoaderConfig::default();
    config.cache.mode = CacheMode::SharedTtl;
    let engine = user_engine(config, slow_fetcher(calls.clone(), Duration::from_millis(100)));
    let scope = engine.open();

    let in_flight = tokio::spawn(scope.load("User", 1).unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(total_calls(&calls), 1);

    scope.close();
    assert!(matches!(
        in_flight.await.unwrap(),
        Err(LoadError::Cancelled { .. })
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.cache_stats().unwrap().total_entries, 0);
}

#[tokio::test]
async fn test_close_before_flush_cancels_pending_loads() {
    let calls = Calls::default();
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(calls.clone()));
    let scope = engine.open();

    let pending = scope.load("User", 1).unwrap();
    scope.close();
    scope.close();

    assert!(matches!(pending.await, Err(LoadError::Cancelled { .. })));
    tokio::task::yield_now().await;
    assert_eq!(total_calls(&calls), 0);
}

#[tokio::test]
async fn test_load_after_close_fails_synchronously() {
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(Calls::default()));
    let scope = engine.open();
    scope.close();

    assert!(scope.is_closed());
    assert!(matches!(
        scope.load("User", 1),
        Err(LoadError::Cancelled { .. })
    ));
    assert!(matches!(
        scope.prime_key("User", 1, "x".to_string()),
        Err(LoadError::Cancelled { .. })
    ));
}

#[tokio::test]
async fn test_fetcher_sees_scope_cancellation() {
    struct WaitsForCancel {
        saw_cancel: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Fetcher<u64, String> for WaitsForCancel {
        async fn fetch(
            &self,
            ctx: &FetchContext<u64, String>,
            _keys: &[u64],
        ) -> Result<KeyOutcomes<u64, String>, FetchError> {
            let token = ctx.cancellation_token();
            let saw_cancel = self.saw_cancel.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                saw_cancel.fetch_add(1, Ordering::SeqCst);
            });
            ctx.cancelled().await;
            Err(FetchError::transient("cancelled"))
        }
    }

    let saw_cancel = Arc::new(AtomicU32::new(0));
    let engine = user_engine(
        LoaderConfig::default(),
        WaitsForCancel {
            saw_cancel: saw_cancel.clone(),
        },
    );
    let scope = engine.open();

    let in_flight = tokio::spawn(scope.load("User", 1).unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    scope.close();

    assert!(matches!(
        in_flight.await.unwrap(),
        Err(LoadError::Cancelled { .. })
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(saw_cancel.load(Ordering::SeqCst), 1);
}

// == Configuration ==

#[tokio::test]
async fn test_unknown_entity_type_fails_synchronously() {
    let engine = user_engine(LoaderConfig::default(), echo_fetcher(Calls::default()));
    let scope = engine.open();

    assert_eq!(
        scope.load("Comment", 1).err(),
        Some(LoadError::UnknownEntityType(EntityType::from("Comment")))
    );
    assert!(scope.load_many("Comment", vec![1, 2]).is_err());
}

#[test]
fn test_builder_rejects_invalid_config() {
    let config = LoaderConfig {
        max_batch_size: 0,
        ..LoaderConfig::default()
    };
    let result = Engine::<u64, String>::builder(config)
        .register("User", echo_fetcher(Calls::default()))
        .build();
    assert!(matches!(result, Err(LoadError::InvalidConfig(_))));

    let result = Engine::<u64, String>::builder(LoaderConfig::default())
        .register("User", echo_fetcher(Calls::default()))
        .register("User", echo_fetcher(Calls::default()))
        .build();
    assert!(matches!(result, Err(LoadError::InvalidConfig(_))));
}

// == Hooks and Observers ==

struct RecordingHook {
    name: &'static str,
    events: Arc<Mutex<Vec<String>>>,
    reports: Arc<Mutex<Vec<FlushReport>>>,
}

impl FlushHook<u64> for RecordingHook {
    fn before_flush(&self, entity_type: &EntityType, keys: &[u64]) {
        self.events
            .lock()
            .push(format!("{}:before:{}:{}", self.name, entity_type, keys.len()));
    }

    fn after_flush(&self, entity_type: &EntityType, report: &FlushReport) {
        self.events
            .lock()
            .push(format!("{}:after:{}", self.name, entity_type));
        self.reports.lock().push(report.clone());
    }
}

#[tokio::test]
async fn test_hooks_run_in_order_around_flush() {
    let events: Arc<Mutex<Vec<String>>> = Arc::default();
    let reports: Arc<Mutex<Vec<FlushReport>>> = Arc::default();
    let hook = |name| {
        Arc::new(RecordingHook {
            name,
            events: events.clone(),
            reports: reports.clone(),
        })
    };

    let engine: Engine<u64, String> = Engine::builder(LoaderConfig::default())
        .register(
            "User",
            from_fn(|ids: Vec<u64>| async move {
                let outcomes: KeyOutcomes<u64, String> = ids
                    .into_iter()
                    .filter(|id| *id != 3)
                    .map(|id| (id, Ok(format!("v{id}"))))
                    .collect();
                Ok::<_, FetchError>(outcomes)
            }),
        )
        .hook(hook("first"))
        .hook(hook("second"))
        .build()
        .unwrap();

    let settled = engine
        .open()
        .load_many_settled("User", vec![1, 2, 3])
        .unwrap()
        .await;
    assert_eq!(settled.iter().filter(|r| r.is_ok()).count(), 2);

    assert_eq!(
        *events.lock(),
        vec![
            "first:before:User:3",
            "second:before:User:3",
            "first:after:User",
            "second:after:User",
        ]
    );
    let report = reports.lock()[0].clone();
    assert_eq!(report.keys, 3);
    assert_eq!(report.resolved, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.attempts, 1);
    assert!(!report.batch_failed);
}

#[tokio::test]
async fn test_stats_observer_sees_hits_misses_and_errors() {
    let stats = Arc::new(StatsObserver::new());
    let engine: Engine<u64, String> = Engine::builder(LoaderConfig::default())
        .register(
            "User",
            from_fn(|ids: Vec<u64>| async move {
                let outcomes: KeyOutcomes<u64, String> = ids
                    .into_iter()
                    .filter(|id| *id != 2)
                    .map(|id| (id, Ok(format!("v{id}"))))
                    .collect();
                Ok::<_, FetchError>(outcomes)
            }),
        )
        .observer(stats.clone() as Arc<dyn LoadObserver>)
        .build()
        .unwrap();
    let scope = engine.open();

    let _ = scope.load_many_settled("User", vec![1, 2]).unwrap().await;
    let _ = scope.load("User", 1).unwrap().await;

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.batches_flushed, 1);
    assert_eq!(snapshot.keys_fetched, 2);
    assert_eq!(snapshot.cache_misses, 2);
    assert_eq!(snapshot.cache_hits, 1);
    assert_eq!(snapshot.fetches_completed, 1);
    assert_eq!(snapshot.errors, 1);
}
