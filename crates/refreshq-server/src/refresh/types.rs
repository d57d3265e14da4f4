//! Core types for the refresh queue

use chrono::{DateTime, NaiveDate, Utc};
use refreshq_common::{DataType, EntityKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::RefreshError;

/// Queue job status
///
/// Transitions only move forward: `pending -> processing -> complete | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    /// Pending and processing jobs occupy the (entity, data type) slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = RefreshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            other => Err(RefreshError::Storage(format!("unknown job status '{}'", other))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refresh job (maps to refresh_jobs table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: Uuid,
    pub entity_key: EntityKey,
    pub data_type: DataType,
    pub status: JobStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Earliest instant a worker may claim the job (retry backoff)
    pub available_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<Uuid>,
    /// 1 for the first attempt, incremented on every retry job
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub wire_bytes: Option<i64>,
    /// Failed job this one retries
    pub retry_of: Option<Uuid>,
}

impl QueueJob {
    /// A fresh first-attempt job, eligible immediately.
    pub fn pending(
        entity_key: EntityKey,
        data_type: DataType,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_key,
            data_type,
            status: JobStatus::Pending,
            priority,
            created_at: now,
            available_at: now,
            claimed_at: None,
            worker_id: None,
            attempt_count: 1,
            last_error: None,
            completed_at: None,
            wire_bytes: None,
            retry_of: None,
        }
    }

    /// The pending job that retries this failed one.
    pub fn retry(&self, available_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_key: self.entity_key.clone(),
            data_type: self.data_type,
            status: JobStatus::Pending,
            priority: self.priority,
            created_at: now,
            available_at,
            claimed_at: None,
            worker_id: None,
            attempt_count: self.attempt_count + 1,
            last_error: None,
            completed_at: None,
            wire_bytes: None,
            retry_of: Some(self.id),
        }
    }
}

/// Result of an idempotent enqueue for one (entity, data type) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "job_id", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Admitted(Uuid),
    AlreadyFresh,
    AlreadyQueued,
}

impl EnqueueOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnqueueOutcome::Admitted(_) => "admitted",
            EnqueueOutcome::AlreadyFresh => "already_fresh",
            EnqueueOutcome::AlreadyQueued => "already_queued",
        }
    }
}

/// Per-data-type line of a batch enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub data_type: DataType,
    pub outcome: EnqueueOutcome,
}

/// What the store needs to decide admission for one data type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub data_type: DataType,
    pub ttl_minutes: i64,
}

/// Arguments of the completion transition
#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub job_id: Uuid,
    /// Bytes billed by the provider, measured on the wire
    pub wire_bytes: u64,
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Set when the registry entry declares a source timestamp field
    pub requires_source_timestamp: bool,
    pub completed_at: DateTime<Utc>,
}

/// Arguments of the failure transition
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub job_id: Uuid,
    pub error: String,
    /// When set, a retry job becomes claimable at this instant (if attempts remain)
    pub retry_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
    pub failed_at: DateTime<Utc>,
}

/// Daily quota usage (maps to quota_usage table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsageRecord {
    pub date: NaiveDate,
    pub total_bytes: i64,
    pub exceeded: bool,
}

/// Last successful fetch of one (entity, data type) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshState {
    pub entity_key: EntityKey,
    pub data_type: DataType,
    pub last_fetched_at: DateTime<Utc>,
    pub source_timestamp: Option<DateTime<Utc>>,
}

/// Scheduled job bookkeeping read by the health monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHealthRecord {
    pub job_name: String,
    pub last_run: Option<DateTime<Utc>>,
    pub expected_interval_minutes: i64,
}

/// Entity with active dashboard subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub entity_key: EntityKey,
    pub data_types: Vec<DataType>,
    pub last_subscribed_at: DateTime<Utc>,
}

/// Transient input of the subscription-triggered enqueue path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub entity_key: EntityKey,
    pub data_types: Vec<DataType>,
}

/// Validated provider record as written to its storage target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub entity_key: EntityKey,
    pub payload: serde_json::Value,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}
