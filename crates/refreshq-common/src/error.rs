//! Error types shared across refreshq crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while building shared domain values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    #[error("Unknown data type: {0}")]
    UnknownDataType(String),

    #[error("Invalid entity key: {0}")]
    InvalidEntityKey(String),
}
