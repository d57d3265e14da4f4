//! Subscription tracking feature

pub mod commands;
pub mod routes;

pub use commands::TrackSubscriptionCommand;
pub use routes::subscriptions_routes;
