//! Storage interfaces for the refresh queue
//!
//! Each concern gets its own narrow trait so services depend only on what
//! they use. [`RefreshStore`] bundles them for backends that implement all
//! of them, which is what the server wires up.
//!
//! Two backends exist:
//!
//! - [`postgres::PgStore`]: shared transactional storage used in production
//! - [`memory::MemoryStore`]: single-process store for tests and local runs

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use refreshq_common::{DataType, EntityKey};
use uuid::Uuid;

use crate::refresh::error::RefreshResult;
use crate::refresh::registry::RegistryEntry;
use crate::refresh::types::{
    BatchOutcome, EnqueueRequest, JobCompletion, JobFailure, JobHealthRecord, QueueJob,
    RefreshState, StoredRecord, TrackedEntity,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Job admission and lifecycle transitions
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Atomically check staleness and outstanding jobs for every requested
    /// data type, inserting a pending job where both checks pass.
    ///
    /// One round trip regardless of the number of data types.
    async fn enqueue_batch(
        &self,
        entity_key: &EntityKey,
        requests: &[EnqueueRequest],
        priority: i32,
        now: DateTime<Utc>,
    ) -> RefreshResult<Vec<BatchOutcome>>;

    /// Claim the highest priority, oldest eligible pending job.
    async fn claim_next(&self, worker_id: Uuid, now: DateTime<Utc>)
        -> RefreshResult<Option<QueueJob>>;

    /// Move a processing job to complete, record its refresh state and add
    /// its wire bytes to the day's quota, all in one transaction.
    async fn complete_job(&self, completion: &JobCompletion) -> RefreshResult<QueueJob>;

    /// Move a processing job to failed. Returns the retry job when one was
    /// spawned.
    async fn fail_job(&self, failure: &JobFailure) -> RefreshResult<Option<QueueJob>>;

    /// Processing jobs claimed before the given instant.
    async fn expired_leases(&self, claimed_before: DateTime<Utc>) -> RefreshResult<Vec<QueueJob>>;

    async fn get_job(&self, job_id: Uuid) -> RefreshResult<Option<QueueJob>>;

    /// Jobs ordered by creation time, optionally filtered.
    async fn list_jobs(
        &self,
        entity_key: Option<&EntityKey>,
        data_type: Option<DataType>,
    ) -> RefreshResult<Vec<QueueJob>>;
}

/// Daily provider byte usage
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Total bytes recorded for the day (0 when nothing was recorded).
    async fn usage(&self, date: NaiveDate) -> RefreshResult<i64>;

    /// Atomically add bytes to the day's total, returning the new total.
    async fn add_usage(&self, date: NaiveDate, bytes: i64) -> RefreshResult<i64>;
}

/// Last successful fetch per (entity, data type)
#[async_trait]
pub trait RefreshStateStore: Send + Sync {
    async fn refresh_state(
        &self,
        entity_key: &EntityKey,
        data_type: DataType,
    ) -> RefreshResult<Option<RefreshState>>;
}

/// Scheduled job bookkeeping
#[async_trait]
pub trait JobHealthStore: Send + Sync {
    async fn record_run(&self, record: &JobHealthRecord) -> RefreshResult<()>;

    /// Stored records for the given job names. Names never run are absent.
    async fn job_health(&self, job_names: &[String]) -> RefreshResult<Vec<JobHealthRecord>>;
}

/// Entities with active subscribers
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Upsert the entity, merging data types with the ones already tracked.
    async fn track(
        &self,
        entity_key: &EntityKey,
        data_types: &[DataType],
        at: DateTime<Utc>,
    ) -> RefreshResult<()>;

    async fn active_entities(&self, since: DateTime<Utc>) -> RefreshResult<Vec<TrackedEntity>>;
}

/// Destination for validated provider records
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Insert or replace records in `table`, keyed by `conflict_key`.
    ///
    /// An existing row is only replaced when it has no source timestamp or
    /// the incoming one is strictly newer. Returns the number of rows
    /// written, so a record skipped by that rule is not counted.
    async fn upsert(
        &self,
        table: &str,
        records: &[StoredRecord],
        conflict_key: &str,
    ) -> RefreshResult<u64>;
}

/// Where registry entries are loaded from
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn load_entries(&self) -> RefreshResult<Vec<RegistryEntry>>;
}

/// Every storage concern behind one object
pub trait RefreshStore:
    QueueStore
    + QuotaStore
    + RefreshStateStore
    + JobHealthStore
    + TrackingStore
    + RecordSink
    + RegistrySource
{
}

impl<T> RefreshStore for T where
    T: QueueStore
        + QuotaStore
        + RefreshStateStore
        + JobHealthStore
        + TrackingStore
        + RecordSink
        + RegistrySource
{
}

/// Reject table and column names that are not plain SQL identifiers.
///
/// Storage targets come from the registry and are interpolated into SQL, so
/// only `[a-z_][a-z0-9_]*` is accepted.
pub fn validate_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
