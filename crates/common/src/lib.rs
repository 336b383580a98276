//! Newswire Common Library
//!
//! Shared code for the scraper, ingestion and notifier services including:
//! - Domain types and envelope validation
//! - Retry policy
//! - Queue transport with batching, reconnect and dead-lettering
//! - Storage traits, Postgres repository and in-memory store
//! - Live delivery registry
//! - Error types, configuration, metrics and process bootstrap

pub mod config;
pub mod db;
pub mod errors;
pub mod live;
pub mod metrics;
pub mod models;
pub mod retry;
pub mod service;
pub mod transport;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{AppError, Result};
pub use retry::RetryPolicy;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
