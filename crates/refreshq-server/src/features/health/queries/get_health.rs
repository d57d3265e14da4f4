//! Get health query

use mediator::Request;
use serde::{Deserialize, Serialize};

use crate::refresh::{HealthMonitor, HealthReport, RefreshResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetHealthQuery;

impl Request<RefreshResult<HealthReport>> for GetHealthQuery {}

pub async fn handle(
    monitor: &HealthMonitor,
    _query: GetHealthQuery,
) -> RefreshResult<HealthReport> {
    monitor.check().await
}
