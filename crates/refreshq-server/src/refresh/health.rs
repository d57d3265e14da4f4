//! Scheduled job health monitoring
//!
//! Every periodic task records its last run. The monitor flags a task as
//! stale once it is overdue by more than the expected interval plus a
//! buffer, or if it never ran at all.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

use super::error::RefreshResult;
use super::types::JobHealthRecord;
use crate::store::JobHealthStore;

pub const STALENESS_SWEEP_JOB: &str = "staleness_sweep";
pub const LEASE_REAPER_JOB: &str = "lease_reaper";
pub const REFRESH_WORKER_JOB: &str = "refresh_worker";

pub const DEFAULT_BUFFER_MINUTES: i64 = 2;

/// A periodic task the monitor audits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredJob {
    pub name: String,
    pub expected_interval_minutes: i64,
}

impl MonitoredJob {
    pub fn new(name: impl Into<String>, expected_interval_minutes: i64) -> Self {
        Self {
            name: name.into(),
            expected_interval_minutes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepHealth {
    pub job_name: String,
    pub last_run: Option<DateTime<Utc>>,
    pub expected_interval_minutes: i64,
    /// Minutes past the expected interval, when the job has run
    pub minutes_overdue: Option<i64>,
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    pub jobs: Vec<SweepHealth>,
}

impl HealthReport {
    pub fn stale_jobs(&self) -> Vec<SweepHealth> {
        self.jobs.iter().filter(|job| !job.healthy).cloned().collect()
    }
}

/// Whether a job that last ran at `last_run` is still on schedule.
pub fn is_on_schedule(
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    expected_interval_minutes: i64,
    buffer_minutes: i64,
) -> bool {
    match last_run {
        Some(last) => now - last <= Duration::minutes(expected_interval_minutes + buffer_minutes),
        None => false,
    }
}

/// Record a run of a periodic job. Failures are logged, not propagated.
pub async fn record_job_run(
    store: &dyn JobHealthStore,
    job_name: &str,
    expected_interval_minutes: i64,
    now: DateTime<Utc>,
) {
    let record = JobHealthRecord {
        job_name: job_name.to_string(),
        last_run: Some(now),
        expected_interval_minutes,
    };

    if let Err(e) = store.record_run(&record).await {
        warn!(job_name, error = %e, "Failed to record job run");
    }
}

pub struct HealthMonitor {
    store: Arc<dyn JobHealthStore>,
    jobs: Vec<MonitoredJob>,
    buffer_minutes: i64,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn JobHealthStore>,
        jobs: Vec<MonitoredJob>,
        buffer_minutes: i64,
    ) -> Self {
        Self {
            store,
            jobs,
            buffer_minutes,
        }
    }

    pub fn buffer_minutes(&self) -> i64 {
        self.buffer_minutes
    }

    pub async fn check(&self) -> RefreshResult<HealthReport> {
        self.check_at(Utc::now()).await
    }

    /// Build the report for every monitored job.
    ///
    /// A stored interval takes precedence over the configured one.
    pub async fn check_at(&self, now: DateTime<Utc>) -> RefreshResult<HealthReport> {
        let names: Vec<String> = self.jobs.iter().map(|job| job.name.clone()).collect();
        let records: HashMap<String, JobHealthRecord> = self
            .store
            .job_health(&names)
            .await?
            .into_iter()
            .map(|record| (record.job_name.clone(), record))
            .collect();

        let jobs: Vec<SweepHealth> = self
            .jobs
            .iter()
            .map(|job| {
                let record = records.get(&job.name);
                let last_run = record.and_then(|r| r.last_run);
                let interval = record
                    .map(|r| r.expected_interval_minutes)
                    .unwrap_or(job.expected_interval_minutes);

                SweepHealth {
                    job_name: job.name.clone(),
                    last_run,
                    expected_interval_minutes: interval,
                    minutes_overdue: last_run
                        .map(|last| ((now - last).num_minutes() - interval).max(0)),
                    healthy: is_on_schedule(last_run, now, interval, self.buffer_minutes),
                }
            })
            .collect();

        Ok(HealthReport {
            healthy: jobs.iter().all(|job| job.healthy),
            checked_at: now,
            jobs,
        })
    }
}
