//! Error types for the loader
//!
//! `FetchError` is what a fetcher reports, `LoadError` is what a caller of
//! `load()` observes. Both are `Clone` so a single outcome can be handed to
//! every waiter of a key.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::loader::EntityType;

// == Fetch Error ==
/// Failure reported by a fetcher, either for one key or for a whole batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The backing store has no value for the key
    #[error("no value for key")]
    NotFound,

    /// Connectivity-class failure, eligible for retry
    #[error("transient failure: {0}")]
    Transient(String),

    /// A single attempt exceeded the configured fetch timeout
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// Validation or authorization failure, never retried
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl FetchError {
    /// Shorthand for a transient failure.
    pub fn transient(message: impl Into<String>) -> Self {
        FetchError::Transient(message.into())
    }

    /// Shorthand for a permanent failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        FetchError::Permanent(message.into())
    }

    /// Returns true if the retry policy may try again after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Timeout(_))
    }
}

// == Load Error ==
/// Outcome of a failed `load()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The fetcher reported no value for the key, or omitted it
    #[error("{entity_type} not found: {key}")]
    KeyNotFound { entity_type: EntityType, key: String },

    /// Per-key transient failure reported by the fetcher
    #[error("transient failure loading {entity_type} {key}: {message}")]
    Transient {
        entity_type: EntityType,
        key: String,
        message: String,
    },

    /// Per-key permanent failure reported by the fetcher
    #[error("permanent failure loading {entity_type} {key}: {message}")]
    Permanent {
        entity_type: EntityType,
        key: String,
        message: String,
    },

    /// The fetch call itself failed; every waiter of the batch gets this
    #[error("batch fetch of {entity_type} [{}] failed: {source}", .keys.join(", "))]
    BatchFailed {
        entity_type: EntityType,
        keys: Vec<String>,
        #[source]
        source: FetchError,
    },

    /// The scope was closed before the key resolved
    #[error("scope closed while loading {entity_type}")]
    Cancelled { entity_type: EntityType },

    /// No fetcher is registered for the entity type
    #[error("no fetcher registered for entity type {0}")]
    UnknownEntityType(EntityType),

    /// Rejected engine configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LoadError {
    /// Converts a per-key fetcher error into the error seen by that key's waiters.
    pub fn for_key(entity_type: EntityType, key: String, error: FetchError) -> Self {
        match error {
            FetchError::NotFound => LoadError::KeyNotFound { entity_type, key },
            FetchError::Permanent(message) => LoadError::Permanent {
                entity_type,
                key,
                message,
            },
            FetchError::Transient(message) => LoadError::Transient {
                entity_type,
                key,
                message,
            },
            timeout @ FetchError::Timeout(_) => LoadError::Transient {
                entity_type,
                key,
                message: timeout.to_string(),
            },
        }
    }

    /// Returns true if this error may be stored as a negative cache entry.
    ///
    /// Only permanent per-key answers are cached; anything transient or
    /// batch-wide must stay retryable by a later batch.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            LoadError::KeyNotFound { .. } | LoadError::Permanent { .. }
        )
    }

    /// Entity type the error relates to, if any.
    pub fn entity_type(&self) -> Option<&EntityType> {
        match self {
            LoadError::KeyNotFound { entity_type, .. }
            | LoadError::Transient { entity_type, .. }
            | LoadError::Permanent { entity_type, .. }
            | LoadError::BatchFailed { entity_type, .. }
            | LoadError::Cancelled { entity_type } => Some(entity_type),
            LoadError::UnknownEntityType(entity_type) => Some(entity_type),
            LoadError::InvalidConfig(_) => None,
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the loader.
pub type Result<T> = std::result::Result<T, LoadError>;

// == API Error ==
/// Error returned by the demo HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    /// A load failed
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Malformed request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A fetcher answered with a record of another entity type
    #[error("Unexpected record: expected {expected}, got {found}")]
    UnexpectedRecord {
        expected: &'static str,
        found: &'static str,
    },
}

/// Result type of the demo HTTP handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

// == IntoResponse Implementation ==
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnexpectedRecord { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Load(LoadError::KeyNotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Load(LoadError::Transient { .. } | LoadError::Cancelled { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Load(LoadError::Permanent { .. } | LoadError::BatchFailed { .. }) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Load(LoadError::UnknownEntityType(_) | LoadError::InvalidConfig(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
