//! refreshq Server Library
//!
//! Staleness-aware refresh queue for cached financial records.
//!
//! # Overview
//!
//! Subscriptions and a periodic sweep admit refresh jobs for records whose
//! age exceeds their data type's TTL. Workers claim jobs, fetch from the
//! provider under a daily byte quota, validate the payload and write it to
//! the data type's storage table.
//!
//! - **Queue**: idempotent admission, priority claims, retry with backoff
//! - **Staleness**: age TTLs plus monotonic source timestamps
//! - **Quota**: daily wire-byte ledger that resets at UTC midnight
//! - **Health**: heartbeats for scheduled jobs, exposed at `/health-check`
//!
//! # Architecture
//!
//! HTTP handlers follow the CQRS split in [`features`]: commands for
//! writes (`POST /track-subscription`), queries for reads. Storage sits
//! behind the narrow traits in [`store`], with a PostgreSQL backend for
//! production and an in-memory backend for tests and local runs.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use refreshq_server::{
//!     api, config::Config, provider::HttpProvider, services::Services, store::MemoryStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let provider = Arc::new(HttpProvider::new(&config.provider)?);
//!     let services = Services::build(&config, Arc::new(MemoryStore::new()), provider);
//!     api::serve(api::create_router(services.feature_state(), &config), &config).await
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod middleware;
pub mod provider;
pub mod refresh;
pub mod services;
pub mod store;

// Re-export commonly used types
pub use error::AppError;
pub use refresh::{RefreshError, RefreshResult};
