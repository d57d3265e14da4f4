//! List jobs query
//!
//! Jobs for one entity, optionally narrowed to a data type.

use mediator::Request;
use refreshq_common::{DataType, EntityKey};
use serde::{Deserialize, Serialize};

use crate::refresh::{QueueJob, RefreshQueue, RefreshResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub entity_key: EntityKey,
    #[serde(default)]
    pub data_type: Option<DataType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<QueueJob>,
    pub total: usize,
}

impl Request<RefreshResult<ListJobsResponse>> for ListJobsQuery {}

pub async fn handle(queue: &RefreshQueue, query: ListJobsQuery) -> RefreshResult<ListJobsResponse> {
    let jobs = queue
        .list_jobs(Some(&query.entity_key), query.data_type)
        .await?;
    Ok(ListJobsResponse {
        total: jobs.len(),
        jobs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_string_shape() {
        let query: ListJobsQuery =
            serde_json::from_str(r#"{"entityKey":"msft","dataType":"quote"}"#).unwrap();
        assert_eq!(query.entity_key.as_str(), "MSFT");
        assert_eq!(query.data_type, Some(DataType::Quote));
    }
}
