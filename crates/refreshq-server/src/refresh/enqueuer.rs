//! Enqueue triggers
//!
//! Two paths admit jobs: a dashboard subscription (one entity, several data
//! types) and the periodic staleness sweep over every recently subscribed
//! entity. The subscription path never fails its caller; the sweep catches
//! whatever it missed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::error::RefreshResult;
use super::health::{record_job_run, STALENESS_SWEEP_JOB};
use super::queue::RefreshQueue;
use super::types::{EnqueueOutcome, SubscriptionEvent};
use crate::store::{JobHealthStore, TrackingStore};

pub const SUBSCRIPTION_PRIORITY: i32 = 10;
pub const SWEEP_PRIORITY: i32 = 0;

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub entities: usize,
    pub admitted: usize,
    pub already_fresh: usize,
    pub already_queued: usize,
    pub errors: usize,
}

pub struct Enqueuer {
    queue: Arc<RefreshQueue>,
    tracking: Arc<dyn TrackingStore>,
    health: Arc<dyn JobHealthStore>,
    active_window: Duration,
    sweep_interval_minutes: i64,
}

impl Enqueuer {
    pub fn new(
        queue: Arc<RefreshQueue>,
        tracking: Arc<dyn TrackingStore>,
        health: Arc<dyn JobHealthStore>,
        active_window: Duration,
        sweep_interval_minutes: i64,
    ) -> Self {
        Self {
            queue,
            tracking,
            health,
            active_window,
            sweep_interval_minutes,
        }
    }

    /// Handle a subscription: remember the entity and admit stale data types.
    ///
    /// Errors are logged and swallowed.
    pub async fn on_subscription(&self, event: &SubscriptionEvent) {
        self.on_subscription_at(event, Utc::now()).await
    }

    pub async fn on_subscription_at(&self, event: &SubscriptionEvent, now: DateTime<Utc>) {
        if event.data_types.is_empty() {
            return;
        }

        if let Err(e) = self
            .tracking
            .track(&event.entity_key, &event.data_types, now)
            .await
        {
            warn!(entity_key = %event.entity_key, error = %e, "Failed to track subscription");
        }

        if let Err(e) = self
            .queue
            .enqueue_batch_at(&event.entity_key, &event.data_types, SUBSCRIPTION_PRIORITY, now)
            .await
        {
            warn!(
                entity_key = %event.entity_key,
                error = %e,
                "Subscription enqueue failed, leaving it to the staleness sweep"
            );
        }
    }

    /// Enqueue stale data for every entity subscribed within the active window.
    pub async fn sweep(&self, now: DateTime<Utc>) -> RefreshResult<SweepSummary> {
        let entities = self.tracking.active_entities(now - self.active_window).await?;
        let mut summary = SweepSummary {
            entities: entities.len(),
            ..SweepSummary::default()
        };

        for entity in &entities {
            match self
                .queue
                .enqueue_batch_at(&entity.entity_key, &entity.data_types, SWEEP_PRIORITY, now)
                .await
            {
                Ok(outcomes) => {
                    for line in outcomes {
                        match line.outcome {
                            EnqueueOutcome::Admitted(_) => summary.admitted += 1,
                            EnqueueOutcome::AlreadyFresh => summary.already_fresh += 1,
                            EnqueueOutcome::AlreadyQueued => summary.already_queued += 1,
                        }
                    }
                }
                Err(e) => {
                    summary.errors += 1;
                    warn!(entity_key = %entity.entity_key, error = %e, "Sweep enqueue failed");
                }
            }
        }

        record_job_run(
            self.health.as_ref(),
            STALENESS_SWEEP_JOB,
            self.sweep_interval_minutes,
            now,
        )
        .await;

        info!(
            entities = summary.entities,
            admitted = summary.admitted,
            already_fresh = summary.already_fresh,
            already_queued = summary.already_queued,
            errors = summary.errors,
            "Staleness sweep finished"
        );

        Ok(summary)
    }
}
