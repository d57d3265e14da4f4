//! Subscription routes

use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Router};

use super::commands::track::{handle as handle_track, TrackSubscriptionCommand};
use crate::api::response::Acknowledged;
use crate::error::AppError;
use crate::features::FeatureState;

pub fn subscriptions_routes() -> Router<FeatureState> {
    Router::new().route("/track-subscription", post(track_subscription))
}

/// POST /track-subscription
///
/// Authentication is checked before the body is looked at.
async fn track_subscription(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Acknowledged, AppError> {
    state.auth.verify(&headers)?;

    let command: TrackSubscriptionCommand = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid request body: {}", e)))?;

    Ok(handle_track(&state.enqueuer, command).await)
}
