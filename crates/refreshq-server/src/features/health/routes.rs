//! Health routes
//!
//! Unauthenticated. Only the aggregate status is exposed.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;

use super::queries::get_health::{handle as handle_get_health, GetHealthQuery};
use crate::features::FeatureState;

pub fn health_routes() -> Router<FeatureState> {
    Router::new().route("/health-check", get(health_check))
}

/// GET /health-check
async fn health_check(State(state): State<FeatureState>) -> Response {
    match handle_get_health(&state.monitor, GetHealthQuery).await {
        Ok(report) if report.healthy => (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "jobs": report.jobs })),
        )
            .into_response(),
        Ok(report) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "staleJobs": report.stale_jobs() })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "staleJobs": [], "error": e.category() })),
            )
                .into_response()
        }
    }
}
