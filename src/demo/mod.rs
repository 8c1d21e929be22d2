//! Demo Blog Backend
//!
//! An in-memory blog store (users and posts) with fetchers that resolve whole
//! batches per call, used by the HTTP demo service and its tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::config::LoaderConfig;
use crate::error::{FetchError, Result};
use crate::loader::{
    Engine, FetchContext, Fetcher, KeyOutcomes, LoadObserver, StatsObserver, TracingObserver,
};

pub const USER: &str = "User";
pub const POST: &str = "Post";

// == Records ==
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: u64,
    pub title: String,
    pub author_id: u64,
}

/// Value type of the demo engine; one engine serves both entity types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlogRecord {
    User(User),
    Post(Post),
}

impl BlogRecord {
    /// Entity type the record belongs to.
    pub fn kind(&self) -> &'static str {
        match self {
            BlogRecord::User(_) => USER,
            BlogRecord::Post(_) => POST,
        }
    }

    pub fn as_user(&self) -> Option<&User> {
        match self {
            BlogRecord::User(user) => Some(user),
            BlogRecord::Post(_) => None,
        }
    }

    pub fn as_post(&self) -> Option<&Post> {
        match self {
            BlogRecord::Post(post) => Some(post),
            BlogRecord::User(_) => None,
        }
    }
}

// == Blog Store ==
/// Backing store standing in for a database. Every batch query counts as one
/// round trip and takes `latency`.
#[derive(Debug, Default)]
pub struct BlogStore {
    users: RwLock<HashMap<u64, User>>,
    posts: RwLock<BTreeMap<u64, Post>>,
    latency: Duration,
    round_trips: AtomicU64,
    unavailable: AtomicBool,
}

impl BlogStore {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Store with a few users and posts.
    pub fn seeded(latency: Duration) -> Self {
        let store = Self::new(latency);
        for (id, name) in [(1, "Ada"), (2, "Grace"), (3, "Linus")] {
            store.insert_user(User {
                id,
                name: name.to_string(),
            });
        }
        let posts = [
            (10, "Batching lookups", 1),
            (11, "Caching per request", 2),
            (12, "Retry with jitter", 1),
            (13, "Bounded concurrency", 3),
        ];
        for (id, title, author_id) in posts {
            store.insert_post(Post {
                id,
                title: title.to_string(),
                author_id,
            });
        }
        store
    }

    pub fn insert_user(&self, user: User) {
        self.users.write().insert(user.id, user);
    }

    pub fn insert_post(&self, post: Post) {
        self.posts.write().insert(post.id, post);
    }

    /// Ids of all posts, ascending.
    pub fn post_ids(&self) -> Vec<u64> {
        self.posts.read().keys().copied().collect()
    }

    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Makes every query fail with a transient error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// One simulated query: counts the round trip, waits out the latency and
    /// fails if the store was made unavailable.
    async fn round_trip(&self) -> std::result::Result<(), FetchError> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(FetchError::transient("blog store unavailable"));
        }
        Ok(())
    }

    pub async fn users_by_ids(&self, ids: &[u64]) -> std::result::Result<Vec<User>, FetchError> {
        self.round_trip().await?;
        let users = self.users.read();
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    pub async fn posts_by_ids(&self, ids: &[u64]) -> std::result::Result<Vec<Post>, FetchError> {
        self.round_trip().await?;
        let posts = self.posts.read();
        Ok(ids.iter().filter_map(|id| posts.get(id).cloned()).collect())
    }
}

// == Fetchers ==
/// Resolves users in one query per batch. Unknown ids are left out and
/// surface as `KeyNotFound`.
pub struct UserFetcher {
    store: Arc<BlogStore>,
}

impl UserFetcher {
    pub fn new(store: Arc<BlogStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Fetcher<u64, BlogRecord> for UserFetcher {
    async fn fetch(
        &self,
        ctx: &FetchContext<u64, BlogRecord>,
        keys: &[u64],
    ) -> std::result::Result<KeyOutcomes<u64, BlogRecord>, FetchError> {
        debug!(batch = ctx.batch_id(), keys = keys.len(), "querying users");
        let rows = tokio::select! {
            rows = self.store.users_by_ids(keys) => rows?,
            _ = ctx.cancelled() => return Err(FetchError::transient("scope closed")),
        };
        Ok(rows
            .into_iter()
            .map(|user| (user.id, Ok(BlogRecord::User(user))))
            .collect())
    }
}

/// Resolves posts in one query per batch.
pub struct PostFetcher {
    store: Arc<BlogStore>,
}

impl PostFetcher {
    pub fn new(store: Arc<BlogStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Fetcher<u64, BlogRecord> for PostFetcher {
    async fn fetch(
        &self,
        ctx: &FetchContext<u64, BlogRecord>,
        keys: &[u64],
    ) -> std::result::Result<KeyOutcomes<u64, BlogRecord>, FetchError> {
        debug!(batch = ctx.batch_id(), keys = keys.len(), "querying posts");
        let rows = tokio::select! {
            rows = self.store.posts_by_ids(keys) => rows?,
            _ = ctx.cancelled() => return Err(FetchError::transient("scope closed")),
        };
        Ok(rows
            .into_iter()
            .map(|post| (post.id, Ok(BlogRecord::Post(post))))
            .collect())
    }
}

/// Builds an engine with both blog fetchers, a tracing observer and a stats
/// observer. The stats observer is returned for the `/stats` endpoint.
pub fn build_engine(
    config: LoaderConfig,
    store: Arc<BlogStore>,
) -> Result<(Engine<u64, BlogRecord>, Arc<StatsObserver>)> {
    let stats = Arc::new(StatsObserver::new());
    let engine = Engine::builder(config)
        .register(USER, UserFetcher::new(store.clone()))
        .register(POST, PostFetcher::new(store))
        .observer(Arc::new(TracingObserver))
        .observer(stats.clone() as Arc<dyn LoadObserver>)
        .build()?;
    Ok((engine, stats))
}
