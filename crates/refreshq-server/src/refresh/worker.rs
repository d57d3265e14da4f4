//! Refresh workers
//!
//! A worker claims one job at a time and runs it through the pipeline:
//! quota gate, provider fetch, strict parse, source timestamp check, upsert
//! and completion. Any failure before completion fails the job with the
//! error's retry policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{RefreshError, RefreshResult};
use super::health::{record_job_run, REFRESH_WORKER_JOB};
use super::queue::RefreshQueue;
use super::quota::QuotaLedger;
use super::registry::Registry;
use super::schema;
use super::staleness::StalenessDetector;
use super::types::{QueueJob, StoredRecord};
use crate::provider::Provider;
use crate::store::{JobHealthStore, RecordSink};

/// Conflict key every storage target is upserted on
pub const STORAGE_CONFLICT_KEY: &str = "entity_key";

/// Outcome of one claimed job
#[derive(Debug, Clone, PartialEq)]
pub enum JobRun {
    Completed(QueueJob),
    Failed {
        job: QueueJob,
        category: &'static str,
        retry: Option<QueueJob>,
    },
    /// The job was taken away (e.g. by the lease reaper) before completion
    Abandoned(QueueJob),
}

/// Services a worker needs, shared by every worker in a pool
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<RefreshQueue>,
    pub registry: Arc<Registry>,
    pub quota: Arc<QuotaLedger>,
    pub staleness: Arc<StalenessDetector>,
    pub provider: Arc<dyn Provider>,
    pub sink: Arc<dyn RecordSink>,
    pub health: Arc<dyn JobHealthStore>,
}

pub struct RefreshWorker {
    worker_id: Uuid,
    hostname: String,
    deps: WorkerDeps,
}

impl RefreshWorker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            deps,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Claim and run at most one job. `None` when the queue had nothing eligible.
    pub async fn run_once(&self) -> RefreshResult<Option<JobRun>> {
        let Some(job) = self.deps.queue.claim_next(self.worker_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.execute(job).await?))
    }

    /// Run a claimed job and settle it.
    pub async fn execute(&self, job: QueueJob) -> RefreshResult<JobRun> {
        let error = match self.process(&job).await {
            Ok(done) => return Ok(JobRun::Completed(done)),
            Err(e) => e,
        };

        if let RefreshError::InvalidTransition { .. } = error {
            warn!(
                job_id = %job.id,
                worker_id = %self.worker_id,
                error = %error,
                "Job no longer owned by this worker"
            );
            return Ok(JobRun::Abandoned(job));
        }

        let category = error.category();
        match self.deps.queue.fail_job(&job, &error).await {
            Ok(retry) => Ok(JobRun::Failed {
                job,
                category,
                retry,
            }),
            Err(RefreshError::InvalidTransition { .. }) => Ok(JobRun::Abandoned(job)),
            Err(e) => Err(e),
        }
    }

    async fn process(&self, job: &QueueJob) -> RefreshResult<QueueJob> {
        let deps = &self.deps;
        let entry = deps.registry.lookup(job.data_type)?;

        deps.quota.admit(Utc::now()).await?;

        let response = deps
            .provider
            .fetch(&job.entity_key, job.data_type)
            .await?
            .check_status(job.data_type)?;
        let wire_bytes = response.wire_size();

        let parsed = schema::parse(&entry, &job.entity_key, &response.body)?;

        deps.staleness
            .validate_source_timestamp(&job.entity_key, job.data_type, parsed.source_timestamp)
            .await?;

        let record = StoredRecord {
            entity_key: job.entity_key.clone(),
            payload: parsed.payload,
            source_timestamp: parsed.source_timestamp,
            fetched_at: Utc::now(),
        };
        let written = deps
            .sink
            .upsert(&entry.storage_target, &[record], STORAGE_CONFLICT_KEY)
            .await?;

        if written == 0 {
            // A newer record landed after the check above; completion still
            // decides whether this job owned its lease.
            warn!(
                job_id = %job.id,
                table = %entry.storage_target,
                source_timestamp = ?parsed.source_timestamp,
                "Stored record is newer, nothing written"
            );
        } else {
            debug!(
                job_id = %job.id,
                table = %entry.storage_target,
                records = parsed.record_count,
                wire_bytes,
                "Records stored"
            );
        }

        deps.queue
            .complete_job(job, wire_bytes, parsed.source_timestamp)
            .await
    }
}

/// Tuning for a pool of workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Minimum spacing between heartbeat writes
    pub heartbeat_every: Duration,
    /// Interval the health monitor expects between heartbeats
    pub heartbeat_interval_minutes: i64,
}

/// Fixed-size pool of polling workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers that run until `shutdown` turns true.
    pub fn spawn(
        deps: WorkerDeps,
        settings: WorkerPoolSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handles = (0..settings.concurrency.max(1))
            .map(|_| {
                let worker = RefreshWorker::new(deps.clone());
                tokio::spawn(run_worker(worker, settings.clone(), shutdown.clone()))
            })
            .collect::<Vec<_>>();

        info!(workers = handles.len(), "Refresh worker pool started");
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Refresh worker task panicked");
            }
        }
    }
}

async fn run_worker(
    worker: RefreshWorker,
    settings: WorkerPoolSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        worker_id = %worker.worker_id(),
        hostname = %worker.hostname(),
        "Refresh worker started"
    );
    let mut last_heartbeat: Option<Instant> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if last_heartbeat.map_or(true, |at| at.elapsed() >= settings.heartbeat_every) {
            record_job_run(
                worker.deps.health.as_ref(),
                REFRESH_WORKER_JOB,
                settings.heartbeat_interval_minutes,
                Utc::now(),
            )
            .await;
            last_heartbeat = Some(Instant::now());
        }

        let idle = match worker.run_once().await {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                error!(
                    worker_id = %worker.worker_id(),
                    error = %e,
                    "Refresh worker iteration failed"
                );
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!(worker_id = %worker.worker_id(), "Refresh worker stopped");
}
