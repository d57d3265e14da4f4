//! Scheduled job health feature

pub mod queries;
pub mod routes;

pub use queries::GetHealthQuery;
pub use routes::health_routes;
