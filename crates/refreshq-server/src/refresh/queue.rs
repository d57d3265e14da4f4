//! Refresh queue service
//!
//! Wraps the [`QueueStore`] with registry lookups, retry scheduling and
//! logging. All admission and transition atomicity lives in the store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use refreshq_common::{DataType, EntityKey};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{RefreshError, RefreshResult};
use super::quota::next_reset;
use super::registry::Registry;
use super::retry::RetryPolicy;
use super::types::{
    BatchOutcome, EnqueueOutcome, EnqueueRequest, JobCompletion, JobFailure, QueueJob,
};
use crate::store::QueueStore;

pub struct RefreshQueue {
    store: Arc<dyn QueueStore>,
    registry: Arc<Registry>,
    retry: RetryPolicy,
}

impl RefreshQueue {
    pub fn new(store: Arc<dyn QueueStore>, registry: Arc<Registry>, retry: RetryPolicy) -> Self {
        Self {
            store,
            registry,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn enqueue_if_stale(
        &self,
        entity_key: &EntityKey,
        data_type: DataType,
        priority: i32,
    ) -> RefreshResult<EnqueueOutcome> {
        self.enqueue_if_stale_at(entity_key, data_type, priority, Utc::now())
            .await
    }

    pub async fn enqueue_if_stale_at(
        &self,
        entity_key: &EntityKey,
        data_type: DataType,
        priority: i32,
        now: DateTime<Utc>,
    ) -> RefreshResult<EnqueueOutcome> {
        let outcomes = self
            .enqueue_batch_at(entity_key, &[data_type], priority, now)
            .await?;

        outcomes
            .into_iter()
            .next()
            .map(|line| line.outcome)
            .ok_or_else(|| RefreshError::Storage("enqueue returned no outcome".to_string()))
    }

    pub async fn enqueue_batch(
        &self,
        entity_key: &EntityKey,
        data_types: &[DataType],
        priority: i32,
    ) -> RefreshResult<Vec<BatchOutcome>> {
        self.enqueue_batch_at(entity_key, data_types, priority, Utc::now())
            .await
    }

    /// Admit every stale, unqueued data type of one entity in a single store call.
    ///
    /// Duplicate data types are collapsed. An unknown data type fails the
    /// whole batch before anything is written.
    pub async fn enqueue_batch_at(
        &self,
        entity_key: &EntityKey,
        data_types: &[DataType],
        priority: i32,
        now: DateTime<Utc>,
    ) -> RefreshResult<Vec<BatchOutcome>> {
        let mut types = data_types.to_vec();
        types.sort();
        types.dedup();

        if types.is_empty() {
            return Ok(Vec::new());
        }

        let requests = types
            .into_iter()
            .map(|data_type| {
                self.registry.lookup(data_type).map(|entry| EnqueueRequest {
                    data_type,
                    ttl_minutes: entry.ttl_minutes,
                })
            })
            .collect::<RefreshResult<Vec<_>>>()?;

        let outcomes = self
            .store
            .enqueue_batch(entity_key, &requests, priority, now)
            .await?;

        for line in &outcomes {
            match line.outcome {
                EnqueueOutcome::Admitted(job_id) => info!(
                    job_id = %job_id,
                    entity_key = %entity_key,
                    data_type = %line.data_type,
                    priority,
                    "Refresh job admitted"
                ),
                other => debug!(
                    entity_key = %entity_key,
                    data_type = %line.data_type,
                    outcome = other.as_str(),
                    "Refresh job not admitted"
                ),
            }
        }

        Ok(outcomes)
    }

    pub async fn claim_next(&self, worker_id: Uuid) -> RefreshResult<Option<QueueJob>> {
        self.claim_next_at(worker_id, Utc::now()).await
    }

    pub async fn claim_next_at(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> RefreshResult<Option<QueueJob>> {
        let job = self.store.claim_next(worker_id, now).await?;
        if let Some(ref job) = job {
            debug!(
                job_id = %job.id,
                worker_id = %worker_id,
                entity_key = %job.entity_key,
                data_type = %job.data_type,
                attempt = job.attempt_count,
                "Job claimed"
            );
        }
        Ok(job)
    }

    /// Complete a processing job.
    ///
    /// `wire_bytes` is the transport size of the provider response. The
    /// source timestamp is mandatory when the registry entry defines one.
    pub async fn complete_job(
        &self,
        job: &QueueJob,
        wire_bytes: u64,
        source_timestamp: Option<DateTime<Utc>>,
    ) -> RefreshResult<QueueJob> {
        let entry = self.registry.lookup(job.data_type)?;
        let completion = JobCompletion {
            job_id: job.id,
            wire_bytes,
            source_timestamp,
            requires_source_timestamp: entry.requires_source_timestamp(),
            completed_at: Utc::now(),
        };

        let done = self.store.complete_job(&completion).await?;
        info!(
            job_id = %done.id,
            entity_key = %done.entity_key,
            data_type = %done.data_type,
            wire_bytes,
            "Job completed"
        );
        Ok(done)
    }

    /// When a job failing with `error` becomes claimable again, if ever.
    pub fn retry_at(
        &self,
        job: &QueueJob,
        error: &RefreshError,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match error {
            RefreshError::QuotaExceeded { .. } => Some(next_reset(now)),
            RefreshError::LeaseExpired(_) => Some(now),
            e if e.is_retryable() => {
                let delay = self.retry.backoff(job.attempt_count);
                Some(now + Duration::from_std(delay).unwrap_or_else(|_| Duration::zero()))
            }
            _ => None,
        }
    }

    /// Fail a processing job, spawning a retry when the error allows it and
    /// attempts remain.
    pub async fn fail_job(
        &self,
        job: &QueueJob,
        error: &RefreshError,
    ) -> RefreshResult<Option<QueueJob>> {
        self.fail_job_at(job, error, Utc::now()).await
    }

    pub async fn fail_job_at(
        &self,
        job: &QueueJob,
        error: &RefreshError,
        now: DateTime<Utc>,
    ) -> RefreshResult<Option<QueueJob>> {
        let failure = JobFailure {
            job_id: job.id,
            error: error.job_error_text(),
            retry_at: self
                .retry_at(job, error, now)
                .filter(|_| self.retry.has_attempts_left(job.attempt_count)),
            max_attempts: self.retry.max_attempts,
            failed_at: now,
        };

        let retry = self.store.fail_job(&failure).await?;
        match retry {
            Some(ref next) => warn!(
                job_id = %job.id,
                retry_job_id = %next.id,
                entity_key = %job.entity_key,
                data_type = %job.data_type,
                attempt = job.attempt_count,
                available_at = %next.available_at,
                error = %error,
                "Job failed, retry scheduled"
            ),
            None => warn!(
                job_id = %job.id,
                entity_key = %job.entity_key,
                data_type = %job.data_type,
                attempt = job.attempt_count,
                error = %error,
                "Job failed permanently"
            ),
        }
        Ok(retry)
    }

    pub async fn get_job(&self, job_id: Uuid) -> RefreshResult<QueueJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(RefreshError::JobNotFound(job_id))
    }

    pub async fn list_jobs(
        &self,
        entity_key: Option<&EntityKey>,
        data_type: Option<DataType>,
    ) -> RefreshResult<Vec<QueueJob>> {
        self.store.list_jobs(entity_key, data_type).await
    }

    /// Processing jobs whose lease started before `claimed_before`.
    pub async fn expired_leases(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> RefreshResult<Vec<QueueJob>> {
        self.store.expired_leases(claimed_before).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::types::{JobStatus, RefreshState};
    use crate::store::MemoryStore;

    fn key() -> EntityKey {
        EntityKey::new("AAPL").unwrap()
    }

    fn queue(store: Arc<MemoryStore>) -> RefreshQueue {
        RefreshQueue::new(store, Arc::new(Registry::with_defaults()), RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_batch_dedupes_and_reports_per_type() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .set_refresh_state(RefreshState {
                entity_key: key(),
                data_type: DataType::CompanyProfile,
                last_fetched_at: now,
                source_timestamp: None,
            })
            .await;
        let queue = queue(store.clone());

        let outcomes = queue
            .enqueue_batch_at(
                &key(),
                &[DataType::Quote, DataType::CompanyProfile, DataType::Quote],
                10,
                now,
            )
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0].outcome, EnqueueOutcome::Admitted(_)));
        assert_eq!(outcomes[1].outcome, EnqueueOutcome::AlreadyFresh);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let queue = queue(Arc::new(MemoryStore::new()));
        assert!(queue.enqueue_batch(&key(), &[], 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_timing_by_error() {
        let queue = queue(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        let job = QueueJob::pending(key(), DataType::Quote, 0, now);

        let quota = RefreshError::QuotaExceeded { used: 10, cap: 10 };
        assert_eq!(queue.retry_at(&job, &quota, now), Some(next_reset(now)));

        let lease = RefreshError::LeaseExpired(job.id);
        assert_eq!(queue.retry_at(&job, &lease, now), Some(now));

        let network = RefreshError::TransientNetwork("reset".into());
        assert!(queue.retry_at(&job, &network, now).unwrap() > now);

        let invalid = RefreshError::validation(DataType::Quote, "bad");
        assert_eq!(queue.retry_at(&job, &invalid, now), None);
    }

    #[tokio::test]
    async fn test_validation_failure_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store);
        queue.enqueue_if_stale(&key(), DataType::Quote, 0).await.unwrap();
        let job = queue.claim_next(Uuid::new_v4()).await.unwrap().unwrap();

        let retry = queue
            .fail_job(&job, &RefreshError::validation(DataType::Quote, "missing price"))
            .await
            .unwrap();
        assert!(retry.is_none());

        let failed = queue.get_job(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("validation_error"));
    }
}
