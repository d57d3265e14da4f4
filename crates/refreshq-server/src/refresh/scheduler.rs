//! Periodic background tasks
//!
//! Runs the staleness sweep, lease reaper, registry reload and health audit
//! on fixed intervals until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::enqueuer::Enqueuer;
use super::health::{record_job_run, HealthMonitor, LEASE_REAPER_JOB};
use super::reaper::LeaseReaper;
use super::registry::Registry;
use crate::store::{JobHealthStore, RegistrySource};

/// Expected interval in whole minutes, rounded up, at least one.
pub fn interval_minutes(period: Duration) -> i64 {
    let secs = period.as_secs() as i64;
    ((secs + 59) / 60).max(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub sweep_interval: Duration,
    pub reaper_interval: Duration,
    pub registry_refresh_interval: Duration,
    pub health_audit_interval: Duration,
}

pub struct RefreshScheduler {
    pub enqueuer: Arc<Enqueuer>,
    pub reaper: Arc<LeaseReaper>,
    pub registry: Arc<Registry>,
    pub registry_source: Arc<dyn RegistrySource>,
    pub monitor: Arc<HealthMonitor>,
    pub health: Arc<dyn JobHealthStore>,
    pub settings: ScheduleSettings,
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        info!(task = name, period_secs = period.as_secs(), "Periodic task started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => task().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(task = name, "Periodic task stopped");
    })
}

impl RefreshScheduler {
    pub fn start(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let settings = self.settings;
        let mut handles = Vec::with_capacity(4);

        let enqueuer = self.enqueuer;
        handles.push(spawn_periodic(
            "staleness_sweep",
            settings.sweep_interval,
            shutdown.clone(),
            move || {
                let enqueuer = enqueuer.clone();
                async move {
                    if let Err(e) = enqueuer.sweep(Utc::now()).await {
                        error!(error = %e, "Staleness sweep failed");
                    }
                }
            },
        ));

        let reaper = self.reaper;
        let health = self.health;
        let reaper_minutes = interval_minutes(settings.reaper_interval);
        handles.push(spawn_periodic(
            "lease_reaper",
            settings.reaper_interval,
            shutdown.clone(),
            move || {
                let reaper = reaper.clone();
                let health = health.clone();
                async move {
                    let now = Utc::now();
                    match reaper.reap(now).await {
                        Ok(count) if count > 0 => {
                            info!(reaped = count, "Lease reaper reclaimed jobs")
                        }
                        Ok(_) => debug!("Lease reaper found no expired leases"),
                        Err(e) => error!(error = %e, "Lease reaper failed"),
                    }
                    record_job_run(health.as_ref(), LEASE_REAPER_JOB, reaper_minutes, now).await;
                }
            },
        ));

        let registry = self.registry;
        let source = self.registry_source;
        handles.push(spawn_periodic(
            "registry_refresh",
            settings.registry_refresh_interval,
            shutdown.clone(),
            move || {
                let registry = registry.clone();
                let source = source.clone();
                async move {
                    // failures are logged by the registry, the old map stays
                    let _ = registry.refresh_from(source.as_ref()).await;
                }
            },
        ));

        let monitor = self.monitor;
        handles.push(spawn_periodic(
            "health_audit",
            settings.health_audit_interval,
            shutdown,
            move || {
                let monitor = monitor.clone();
                async move {
                    match monitor.check().await {
                        Ok(report) if !report.healthy => {
                            for job in report.stale_jobs() {
                                warn!(
                                    job_name = %job.job_name,
                                    last_run = ?job.last_run,
                                    minutes_overdue = ?job.minutes_overdue,
                                    "Scheduled job is stale"
                                );
                            }
                        }
                        Ok(_) => debug!("All scheduled jobs healthy"),
                        Err(e) => error!(error = %e, "Health audit failed"),
                    }
                }
            },
        ));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_minutes_rounds_up() {
        assert_eq!(interval_minutes(Duration::from_secs(30)), 1);
        assert_eq!(interval_minutes(Duration::from_secs(60)), 1);
        assert_eq!(interval_minutes(Duration::from_secs(61)), 2);
        assert_eq!(interval_minutes(Duration::from_secs(300)), 5);
    }
}
