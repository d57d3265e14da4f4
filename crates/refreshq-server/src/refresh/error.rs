//! Error taxonomy for the refresh pipeline
//!
//! Every failure a job can hit maps to exactly one variant. The variant
//! decides whether the job is retried and which category string is stored
//! in `last_error` and surfaced to operators.

use refreshq_common::{DataType, EntityKey};
use thiserror::Error;
use uuid::Uuid;

pub type RefreshResult<T> = std::result::Result<T, RefreshError>;

#[derive(Error, Debug)]
pub enum RefreshError {
    /// Missing or invalid credentials/settings. Fatal, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider payload did not match the strict schema for its data type.
    #[error("Schema validation failed for {data_type}: {message}")]
    Validation { data_type: DataType, message: String },

    /// Provider returned a source timestamp that is not newer than the stored one.
    #[error(
        "Stale payload for {entity_key}/{data_type}: \
         source timestamp {incoming} is not newer than stored {stored}"
    )]
    StalenessViolation {
        entity_key: EntityKey,
        data_type: DataType,
        incoming: chrono::DateTime<chrono::Utc>,
        stored: chrono::DateTime<chrono::Utc>,
    },

    #[error("Daily provider quota exceeded: {used} of {cap} bytes used")]
    QuotaExceeded { used: i64, cap: i64 },

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("No registry entry for data type {0}")]
    UnknownDataType(DataType),

    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: String,
        to: &'static str,
    },

    #[error("Lease expired for job {0}")]
    LeaseExpired(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl RefreshError {
    pub fn validation(data_type: DataType, message: impl Into<String>) -> Self {
        Self::Validation {
            data_type,
            message: message.into(),
        }
    }

    /// Stable category string stored on failed jobs and returned to callers.
    pub fn category(&self) -> &'static str {
        match self {
            RefreshError::Config(_) => "config_error",
            RefreshError::Validation { .. } => "validation_error",
            RefreshError::StalenessViolation { .. } => "staleness_violation",
            RefreshError::QuotaExceeded { .. } => "quota_exceeded",
            RefreshError::TransientNetwork(_) => "transient_network_error",
            RefreshError::Unauthorized(_) => "unauthorized",
            RefreshError::UnknownDataType(_) | RefreshError::JobNotFound(_) => "not_found",
            RefreshError::InvalidTransition { .. } => "invalid_transition",
            RefreshError::LeaseExpired(_) => "lease_expired",
            RefreshError::Database(_) | RefreshError::Storage(_) => "storage_error",
        }
    }

    /// Whether a job failing with this error should spawn a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RefreshError::StalenessViolation { .. }
                | RefreshError::QuotaExceeded { .. }
                | RefreshError::TransientNetwork(_)
                | RefreshError::LeaseExpired(_)
                | RefreshError::Database(_)
                | RefreshError::Storage(_)
        )
    }

    /// Text persisted in `QueueJob::last_error`.
    ///
    /// Only the category. The full message goes to the logs.
    pub fn job_error_text(&self) -> String {
        self.category().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!RefreshError::validation(DataType::Quote, "missing price").is_retryable());
        assert!(!RefreshError::Config("no key".into()).is_retryable());
        assert!(RefreshError::TransientNetwork("timeout".into()).is_retryable());
        assert!(RefreshError::QuotaExceeded { used: 10, cap: 10 }.is_retryable());
    }

    #[test]
    fn test_job_error_text_is_the_category_only() {
        let err = RefreshError::QuotaExceeded { used: 12, cap: 10 };
        assert_eq!(err.job_error_text(), "quota_exceeded");

        let err = RefreshError::TransientNetwork("http://host/quote?apikey=k".into());
        assert_eq!(err.job_error_text(), "transient_network_error");
    }
}
