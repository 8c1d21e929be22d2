//! Request and Response models for the demo HTTP service
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! deserializing query strings and serializing response bodies.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::UsersQuery;
pub use responses::{
    HealthResponse, PostView, PostsResponse, StatsResponse, UserView, UsersResponse,
};
