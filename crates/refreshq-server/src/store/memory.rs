//! In-memory storage backend
//!
//! Every operation runs inside one critical section over the whole state,
//! which gives the same atomicity the PostgreSQL backend gets from
//! transactions and the partial unique index.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use refreshq_common::{DataType, EntityKey};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    validate_identifier, JobHealthStore, QueueStore, QuotaStore, RecordSink, RefreshStateStore,
    RegistrySource, TrackingStore,
};
use crate::refresh::error::{RefreshError, RefreshResult};
use crate::refresh::registry::{default_entries, RegistryEntry};
use crate::refresh::staleness::{check_source_timestamp, is_age_stale};
use crate::refresh::types::{
    BatchOutcome, EnqueueOutcome, EnqueueRequest, JobCompletion, JobFailure, JobHealthRecord,
    JobStatus, QueueJob, RefreshState, StoredRecord, TrackedEntity,
};

type SlotKey = (EntityKey, DataType);

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, QueueJob>,
    /// Active (pending or processing) job per slot
    active: HashMap<SlotKey, Uuid>,
    refresh_state: HashMap<SlotKey, RefreshState>,
    quota: HashMap<NaiveDate, i64>,
    job_health: HashMap<String, JobHealthRecord>,
    tracked: HashMap<EntityKey, TrackedEntity>,
    records: HashMap<String, HashMap<EntityKey, StoredRecord>>,
    registry: Vec<RegistryEntry>,
}

impl MemoryState {
    fn processing_job(&mut self, job_id: Uuid, to: &'static str) -> RefreshResult<&mut QueueJob> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(RefreshError::JobNotFound(job_id))?;

        if job.status != JobStatus::Processing {
            return Err(RefreshError::InvalidTransition {
                job_id,
                from: job.status.to_string(),
                to,
            });
        }

        Ok(job)
    }

    fn insert_job(&mut self, job: QueueJob) {
        self.active
            .insert((job.entity_key.clone(), job.data_type), job.id);
        self.jobs.insert(job.id, job);
    }
}

/// Single-process store used by tests and `REFRESHQ_STORAGE=memory`
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                registry: default_entries(),
                ..MemoryState::default()
            }),
        }
    }

    /// Replace the entries served as the registry source.
    pub async fn set_registry_entries(&self, entries: Vec<RegistryEntry>) {
        self.state.lock().await.registry = entries;
    }

    /// Seed the last-fetch state of a slot.
    pub async fn set_refresh_state(&self, state: RefreshState) {
        self.state
            .lock()
            .await
            .refresh_state
            .insert((state.entity_key.clone(), state.data_type), state);
    }

    pub async fn record(&self, table: &str, entity_key: &EntityKey) -> Option<StoredRecord> {
        self.state
            .lock()
            .await
            .records
            .get(table)
            .and_then(|rows| rows.get(entity_key))
            .cloned()
    }

    pub async fn record_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .await
            .records
            .get(table)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue_batch(
        &self,
        entity_key: &EntityKey,
        requests: &[EnqueueRequest],
        priority: i32,
        now: DateTime<Utc>,
    ) -> RefreshResult<Vec<BatchOutcome>> {
        let mut state = self.state.lock().await;
        let mut outcomes = Vec::with_capacity(requests.len());

        for request in requests {
            let slot = (entity_key.clone(), request.data_type);

            let fresh = state
                .refresh_state
                .get(&slot)
                .is_some_and(|s| !is_age_stale(s.last_fetched_at, now, request.ttl_minutes));

            let outcome = if fresh {
                EnqueueOutcome::AlreadyFresh
            } else if state.active.contains_key(&slot) {
                EnqueueOutcome::AlreadyQueued
            } else {
                let job = QueueJob::pending(entity_key.clone(), request.data_type, priority, now);
                let id = job.id;
                state.insert_job(job);
                EnqueueOutcome::Admitted(id)
            };

            outcomes.push(BatchOutcome {
                data_type: request.data_type,
                outcome,
            });
        }

        Ok(outcomes)
    }

    async fn claim_next(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> RefreshResult<Option<QueueJob>> {
        let mut state = self.state.lock().await;

        let next = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.available_at <= now)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(RefreshError::JobNotFound(id))?;
        job.status = JobStatus::Processing;
        job.claimed_at = Some(now);
        job.worker_id = Some(worker_id);

        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, completion: &JobCompletion) -> RefreshResult<QueueJob> {
        let mut state = self.state.lock().await;
        let job = state
            .processing_job(completion.job_id, JobStatus::Complete.as_str())?
            .clone();
        let slot = (job.entity_key.clone(), job.data_type);

        if completion.requires_source_timestamp && completion.source_timestamp.is_none() {
            return Err(RefreshError::validation(
                job.data_type,
                "source timestamp required but missing",
            ));
        }

        let stored_ts = state
            .refresh_state
            .get(&slot)
            .and_then(|s| s.source_timestamp);
        if let (Some(incoming), Some(stored)) = (completion.source_timestamp, stored_ts) {
            check_source_timestamp(&job.entity_key, job.data_type, incoming, stored)?;
        }

        let wire_bytes = i64::try_from(completion.wire_bytes).unwrap_or(i64::MAX);

        let done = state
            .processing_job(completion.job_id, JobStatus::Complete.as_str())?;
        done.status = JobStatus::Complete;
        done.completed_at = Some(completion.completed_at);
        done.wire_bytes = Some(wire_bytes);
        let done = done.clone();

        state.active.remove(&slot);
        state.refresh_state.insert(
            slot,
            RefreshState {
                entity_key: job.entity_key.clone(),
                data_type: job.data_type,
                last_fetched_at: completion.completed_at,
                source_timestamp: completion.source_timestamp.or(stored_ts),
            },
        );
        *state
            .quota
            .entry(completion.completed_at.date_naive())
            .or_insert(0) += wire_bytes;

        Ok(done)
    }

    async fn fail_job(&self, failure: &JobFailure) -> RefreshResult<Option<QueueJob>> {
        let mut state = self.state.lock().await;
        let job = state.processing_job(failure.job_id, JobStatus::Failed.as_str())?;
        job.status = JobStatus::Failed;
        job.last_error = Some(failure.error.clone());
        job.completed_at = Some(failure.failed_at);
        let failed = job.clone();

        let slot = (failed.entity_key.clone(), failed.data_type);
        state.active.remove(&slot);

        let retry = match failure.retry_at {
            Some(at) if failed.attempt_count < failure.max_attempts => {
                if state.active.contains_key(&slot) {
                    None
                } else {
                    let retry = failed.retry(at, failure.failed_at);
                    state.insert_job(retry.clone());
                    Some(retry)
                }
            }
            _ => None,
        };

        Ok(retry)
    }

    async fn expired_leases(&self, claimed_before: DateTime<Utc>) -> RefreshResult<Vec<QueueJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<QueueJob> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.claimed_at.is_some_and(|at| at < claimed_before)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.claimed_at);
        Ok(jobs)
    }

    async fn get_job(&self, job_id: Uuid) -> RefreshResult<Option<QueueJob>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(
        &self,
        entity_key: Option<&EntityKey>,
        data_type: Option<DataType>,
    ) -> RefreshResult<Vec<QueueJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<QueueJob> = state
            .jobs
            .values()
            .filter(|job| entity_key.map_or(true, |key| &job.entity_key == key))
            .filter(|job| data_type.map_or(true, |dt| job.data_type == dt))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn usage(&self, date: NaiveDate) -> RefreshResult<i64> {
        Ok(self
            .state
            .lock()
            .await
            .quota
            .get(&date)
            .copied()
            .unwrap_or(0))
    }

    async fn add_usage(&self, date: NaiveDate, bytes: i64) -> RefreshResult<i64> {
        let mut state = self.state.lock().await;
        let total = state.quota.entry(date).or_insert(0);
        *total += bytes.max(0);
        Ok(*total)
    }
}

#[async_trait]
impl RefreshStateStore for MemoryStore {
    async fn refresh_state(
        &self,
        entity_key: &EntityKey,
        data_type: DataType,
    ) -> RefreshResult<Option<RefreshState>> {
        Ok(self
            .state
            .lock()
            .await
            .refresh_state
            .get(&(entity_key.clone(), data_type))
            .cloned())
    }
}

#[async_trait]
impl JobHealthStore for MemoryStore {
    async fn record_run(&self, record: &JobHealthRecord) -> RefreshResult<()> {
        self.state
            .lock()
            .await
            .job_health
            .insert(record.job_name.clone(), record.clone());
        Ok(())
    }

    async fn job_health(&self, job_names: &[String]) -> RefreshResult<Vec<JobHealthRecord>> {
        let state = self.state.lock().await;
        Ok(job_names
            .iter()
            .filter_map(|name| state.job_health.get(name).cloned())
            .collect())
    }
}

#[async_trait]
impl TrackingStore for MemoryStore {
    async fn track(
        &self,
        entity_key: &EntityKey,
        data_types: &[DataType],
        at: DateTime<Utc>,
    ) -> RefreshResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .tracked
            .entry(entity_key.clone())
            .or_insert_with(|| TrackedEntity {
                entity_key: entity_key.clone(),
                data_types: Vec::new(),
                last_subscribed_at: at,
            });

        entry.data_types.extend_from_slice(data_types);
        entry.data_types.sort();
        entry.data_types.dedup();
        entry.last_subscribed_at = entry.last_subscribed_at.max(at);
        Ok(())
    }

    async fn active_entities(&self, since: DateTime<Utc>) -> RefreshResult<Vec<TrackedEntity>> {
        let state = self.state.lock().await;
        let mut entities: Vec<TrackedEntity> = state
            .tracked
            .values()
            .filter(|entity| entity.last_subscribed_at >= since)
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
        Ok(entities)
    }
}

#[async_trait]
impl RecordSink for MemoryStore {
    async fn upsert(
        &self,
        table: &str,
        records: &[StoredRecord],
        conflict_key: &str,
    ) -> RefreshResult<u64> {
        if !validate_identifier(table) {
            return Err(RefreshError::Storage(format!("invalid table name '{}'", table)));
        }
        if conflict_key != "entity_key" {
            return Err(RefreshError::Storage(format!(
                "unsupported conflict key '{}'",
                conflict_key
            )));
        }

        let mut state = self.state.lock().await;
        let rows = state.records.entry(table.to_string()).or_default();
        let mut written = 0;
        for record in records {
            let replace = match rows.get(&record.entity_key) {
                None => true,
                Some(existing) => match (existing.source_timestamp, record.source_timestamp) {
                    (None, _) => true,
                    (Some(stored), Some(incoming)) => incoming > stored,
                    (Some(_), None) => false,
                },
            };
            if replace {
                rows.insert(record.entity_key.clone(), record.clone());
                written += 1;
            }
        }
        Ok(written)
    }
}

#[async_trait]
impl RegistrySource for MemoryStore {
    async fn load_entries(&self) -> RefreshResult<Vec<RegistryEntry>> {
        Ok(self.state.lock().await.registry.clone())
    }
}
