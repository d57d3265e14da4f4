//! Job inspection feature

pub mod queries;
pub mod routes;

pub use queries::{GetJobQuery, ListJobsQuery};
pub use routes::jobs_routes;
