//! API Handlers
//!
//! HTTP request handlers for each demo service endpoint.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::demo::{BlogRecord, BlogStore, Post, User, POST, USER};
use crate::error::{ApiError, ApiResult, LoadError};
use crate::loader::{Engine, Scope, StatsObserver};
use crate::models::{
    HealthResponse, PostView, PostsResponse, StatsResponse, UserView, UsersQuery, UsersResponse,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine<u64, BlogRecord>,
    pub stats: Arc<StatsObserver>,
    pub store: Arc<BlogStore>,
}

impl AppState {
    pub fn new(
        engine: Engine<u64, BlogRecord>,
        stats: Arc<StatsObserver>,
        store: Arc<BlogStore>,
    ) -> Self {
        Self {
            engine,
            stats,
            store,
        }
    }
}

// == Scope Helpers ==
fn expect_post(record: &BlogRecord) -> ApiResult<&Post> {
    record.as_post().ok_or(ApiError::UnexpectedRecord {
        expected: POST,
        found: record.kind(),
    })
}

fn expect_user(record: &BlogRecord) -> ApiResult<&User> {
    record.as_user().ok_or(ApiError::UnexpectedRecord {
        expected: USER,
        found: record.kind(),
    })
}

/// Loads posts, then all their authors in one more batch.
async fn posts_with_authors(
    scope: &Scope<u64, BlogRecord>,
    post_ids: Vec<u64>,
) -> ApiResult<Vec<PostView>> {
    let records = scope.load_many(POST, post_ids)?.await?;
    let posts = records
        .iter()
        .map(|record| expect_post(record))
        .collect::<ApiResult<Vec<&Post>>>()?;

    let authors = scope
        .load_many(USER, posts.iter().map(|post| post.author_id))?
        .await?;

    posts
        .iter()
        .zip(authors.iter())
        .map(|(post, author)| -> ApiResult<PostView> {
            Ok(PostView::new(post, expect_user(author)?))
        })
        .collect()
}

async fn post_with_author(scope: &Scope<u64, BlogRecord>, id: u64) -> ApiResult<PostView> {
    let record = scope.load(POST, id)?.await?;
    let post = expect_post(&record)?;
    let author = scope.load(USER, post.author_id)?.await?;
    Ok(PostView::new(post, expect_user(&author)?))
}

/// Handler for GET /posts
///
/// Two fetcher round trips regardless of the number of posts: one for the
/// posts, one for the distinct authors.
pub async fn list_posts(State(state): State<AppState>) -> ApiResult<Json<PostsResponse>> {
    let scope = state.engine.open();
    let posts = posts_with_authors(&scope, state.store.post_ids()).await;
    scope.close();

    Ok(Json(PostsResponse::new(posts?)))
}

/// Handler for GET /posts/:id
pub async fn get_post(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<PostView>> {
    let scope = state.engine.open();
    let post = post_with_author(&scope, id).await;
    scope.close();

    Ok(Json(post?))
}

/// Handler for GET /users?ids=1,2
///
/// Ids with no user are reported in `missing` instead of failing the request.
pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UsersQuery>,
) -> ApiResult<Json<UsersResponse>> {
    let ids = query.parse_ids().map_err(ApiError::InvalidRequest)?;

    let scope = state.engine.open();
    let outcomes = scope.load_many_settled(USER, ids.clone())?.await;
    scope.close();

    let mut users = Vec::with_capacity(ids.len());
    let mut missing = Vec::new();
    for (id, outcome) in ids.into_iter().zip(outcomes) {
        match outcome {
            Ok(record) => users.push(UserView::from(expect_user(&record)?)),
            Err(LoadError::KeyNotFound { .. }) => missing.push(id),
            Err(error) => return Err(error.into()),
        }
    }

    Ok(Json(UsersResponse { users, missing }))
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(
        state.stats.snapshot(),
        state.engine.cache_stats(),
    ))
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
