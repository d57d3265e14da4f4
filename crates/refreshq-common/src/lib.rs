//! refreshq Common Library
//!
//! Shared types, error handling and logging for the refreshq workspace.
//!
//! # Overview
//!
//! - **Types**: the closed set of refreshable data types and entity keys
//! - **Error Handling**: the common error and result types
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use refreshq_common::types::{DataType, EntityKey};
//!
//! fn parse(tag: &str, symbol: &str) -> refreshq_common::Result<(DataType, EntityKey)> {
//!     Ok((tag.parse()?, EntityKey::new(symbol)?))
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{DataType, EntityKey};
