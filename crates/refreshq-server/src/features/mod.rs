//! Feature modules implementing the refreshq API
//!
//! Each feature is a vertical slice with its own commands or queries and
//! routes, following the CQRS split:
//!
//! - **subscriptions**: `POST /track-subscription`, the subscription-triggered enqueue
//! - **health**: `GET /health-check`, aggregate status of the scheduled jobs
//! - **jobs**: read-only job inspection for operators
//!
//! Commands and queries mark themselves with `mediator::Request`.

pub mod health;
pub mod jobs;
pub mod subscriptions;

use std::sync::Arc;

use axum::Router;

use crate::middleware::ApiTokenAuth;
use crate::refresh::{Enqueuer, HealthMonitor, RefreshQueue};

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    pub queue: Arc<RefreshQueue>,
    pub enqueuer: Arc<Enqueuer>,
    pub monitor: Arc<HealthMonitor>,
    pub auth: ApiTokenAuth,
}

/// Creates the API router with all feature routes mounted
pub fn router(state: FeatureState) -> Router<()> {
    Router::new()
        .merge(subscriptions::subscriptions_routes())
        .merge(health::health_routes())
        .nest("/jobs", jobs::jobs_routes())
        .with_state(state)
}
