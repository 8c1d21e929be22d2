//! Background Tasks Module
//!
//! Contains background tasks that run alongside a shared-cache engine.
//!
//! # Tasks
//! - TTL Cleanup: Evicts expired shared-cache entries at configured intervals

mod cleanup;

pub use cleanup::spawn_cleanup_task;
