//! Get job query

use mediator::Request;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::refresh::{QueueJob, RefreshQueue, RefreshResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetJobQuery {
    pub job_id: Uuid,
}

impl Request<RefreshResult<QueueJob>> for GetJobQuery {}

pub async fn handle(queue: &RefreshQueue, query: GetJobQuery) -> RefreshResult<QueueJob> {
    queue.get_job(query.job_id).await
}
