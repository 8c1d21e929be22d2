//! API Module
//!
//! HTTP handlers and routing for the demo blog service. Every request opens
//! its own loader scope and closes it before responding.
//!
//! # Endpoints
//! - `GET /posts` - All posts with their authors
//! - `GET /posts/:id` - One post with its author
//! - `GET /users?ids=1,2` - Several users by id
//! - `GET /stats` - Loader and cache statistics
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
