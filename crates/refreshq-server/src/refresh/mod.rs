//! Staleness-aware refresh queue
//!
//! Control flow:
//!
//! ```text
//! subscription / sweep -> Enqueuer -> RefreshQueue (atomic staleness check + insert)
//!                                          |
//!                   WorkerPool claims -> QuotaLedger gate -> Provider fetch
//!                        -> schema::parse -> source timestamp check -> upsert
//!                        -> complete_job (refresh state + quota add)
//! ```
//!
//! The [`health::HealthMonitor`] audits the periodic tasks independently.

pub mod enqueuer;
pub mod error;
pub mod health;
pub mod queue;
pub mod quota;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod staleness;
pub mod types;
pub mod worker;

pub use enqueuer::{Enqueuer, SweepSummary, SUBSCRIPTION_PRIORITY, SWEEP_PRIORITY};
pub use error::{RefreshError, RefreshResult};
pub use health::{HealthMonitor, HealthReport, MonitoredJob, SweepHealth};
pub use queue::RefreshQueue;
pub use quota::QuotaLedger;
pub use reaper::LeaseReaper;
pub use registry::{Registry, RegistryEntry};
pub use retry::RetryPolicy;
pub use scheduler::{RefreshScheduler, ScheduleSettings};
pub use staleness::StalenessDetector;
pub use types::{
    BatchOutcome, EnqueueOutcome, JobHealthRecord, JobStatus, QueueJob, QuotaUsageRecord,
    RefreshState, StoredRecord, SubscriptionEvent, TrackedEntity,
};
pub use worker::{JobRun, RefreshWorker, WorkerDeps, WorkerPool, WorkerPoolSettings};
