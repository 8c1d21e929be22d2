//! Response DTOs for the demo HTTP service
//!
//! Defines the structure of outgoing HTTP response bodies.

use serde::Serialize;

use crate::cache::CacheStats;
use crate::demo::{Post, User};
use crate::loader::LoadStats;

/// A user as rendered by the API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserView {
    pub id: u64,
    pub name: String,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
        }
    }
}

/// A post with its author resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostView {
    pub id: u64,
    pub title: String,
    pub author: UserView,
}

impl PostView {
    pub fn new(post: &Post, author: &User) -> Self {
        Self {
            id: post.id,
            title: post.title.clone(),
            author: author.into(),
        }
    }
}

/// Response body for GET /posts
#[derive(Debug, Clone, Serialize)]
pub struct PostsResponse {
    pub posts: Vec<PostView>,
    pub count: usize,
}

impl PostsResponse {
    pub fn new(posts: Vec<PostView>) -> Self {
        Self {
            count: posts.len(),
            posts,
        }
    }
}

/// Response body for GET /users
#[derive(Debug, Clone, Serialize)]
pub struct UsersResponse {
    /// Users found, in request order
    pub users: Vec<UserView>,
    /// Requested ids with no user
    pub missing: Vec<u64>,
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    /// Engine-wide load counters
    pub loads: LoadStats,
    /// Mean fetch latency in milliseconds
    pub mean_fetch_latency_ms: f64,
    /// Shared cache statistics, absent in scoped mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    /// Shared cache hit rate (hits / (hits + misses))
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit_rate: Option<f64>,
}

impl StatsResponse {
    pub fn new(loads: LoadStats, cache: Option<CacheStats>) -> Self {
        Self {
            mean_fetch_latency_ms: loads.mean_fetch_latency_ms(),
            cache_hit_rate: cache.as_ref().map(CacheStats::hit_rate),
            loads,
            cache,
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
