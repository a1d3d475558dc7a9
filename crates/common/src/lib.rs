//! Shared building blocks for the courier services: the notification record,
//! configuration, error types, and Redis/retry helpers.

pub mod config;
pub mod error;
pub mod redis_pool;
pub mod retry;
pub mod types;
