//! Job routes
//!
//! Read-only and bearer-authenticated like `/track-subscription`. Jobs cannot
//! be created or changed through these endpoints.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use super::queries::{
    get_job::handle as handle_get_job,
    list_jobs::{handle as handle_list_jobs, ListJobsResponse},
    GetJobQuery, ListJobsQuery,
};
use crate::error::AppError;
use crate::features::FeatureState;
use crate::refresh::QueueJob;

pub fn jobs_routes() -> Router<FeatureState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/:job_id", get(get_job))
}

/// GET /jobs?entityKey=AAPL&dataType=quote
async fn list_jobs(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, AppError> {
    state.auth.verify(&headers)?;
    Ok(Json(handle_list_jobs(&state.queue, query).await?))
}

/// GET /jobs/:job_id
async fn get_job(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<Json<QueueJob>, AppError> {
    state.auth.verify(&headers)?;
    Ok(Json(handle_get_job(&state.queue, GetJobQuery { job_id }).await?))
}
