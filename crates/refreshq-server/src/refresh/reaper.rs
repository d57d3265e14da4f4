//! Lease reaper
//!
//! Recovers jobs whose worker died mid-flight. An expired job is failed
//! with `lease_expired` and, when attempts remain, replaced by a pending
//! retry that is claimable immediately.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::error::{RefreshError, RefreshResult};
use super::queue::RefreshQueue;

pub struct LeaseReaper {
    queue: Arc<RefreshQueue>,
    lease_timeout: Duration,
}

impl LeaseReaper {
    pub fn new(queue: Arc<RefreshQueue>, lease_timeout: Duration) -> Self {
        Self {
            queue,
            lease_timeout,
        }
    }

    /// Reap every lease older than the timeout. Returns the number reaped.
    pub async fn reap(&self, now: DateTime<Utc>) -> RefreshResult<usize> {
        let expired = self.queue.expired_leases(now - self.lease_timeout).await?;
        let mut reaped = 0;

        for job in expired {
            match self
                .queue
                .fail_job_at(&job, &RefreshError::LeaseExpired(job.id), now)
                .await
            {
                Ok(retry) => {
                    reaped += 1;
                    info!(
                        job_id = %job.id,
                        worker_id = ?job.worker_id,
                        claimed_at = ?job.claimed_at,
                        requeued = retry.is_some(),
                        "Reclaimed expired lease"
                    );
                }
                // The worker settled it between listing and failing.
                Err(RefreshError::InvalidTransition { .. }) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to reclaim expired lease"),
            }
        }

        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::registry::Registry;
    use crate::refresh::retry::RetryPolicy;
    use crate::refresh::types::JobStatus;
    use crate::store::MemoryStore;
    use refreshq_common::{DataType, EntityKey};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_expired_lease_is_failed_and_requeued() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(RefreshQueue::new(
            store,
            Arc::new(Registry::with_defaults()),
            RetryPolicy::default(),
        ));
        let key = EntityKey::new("AAPL").unwrap();
        let start = Utc::now();

        queue
            .enqueue_if_stale_at(&key, DataType::Quote, 0, start)
            .await
            .unwrap();
        let claimed = queue.claim_next_at(Uuid::new_v4(), start).await.unwrap().unwrap();

        let reaper = LeaseReaper::new(queue.clone(), Duration::minutes(5));
        assert_eq!(reaper.reap(start + Duration::minutes(4)).await.unwrap(), 0);
        assert_eq!(reaper.reap(start + Duration::minutes(6)).await.unwrap(), 1);

        let old = queue.get_job(claimed.id).await.unwrap();
        assert_eq!(old.status, JobStatus::Failed);
        assert!(old.last_error.unwrap().starts_with("lease_expired"));

        let jobs = queue.list_jobs(Some(&key), None).await.unwrap();
        let retry = jobs.iter().find(|job| job.retry_of == Some(claimed.id)).unwrap();
        assert_eq!(retry.status, JobStatus::Pending);
        assert_eq!(retry.attempt_count, 2);
    }
}
