use axum::{Router, routing::get};

pub mod jobs;
pub mod system;

/// Router for the dashboard endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/stats", get(system::stats))
        .route("/recurring", get(system::recurring))
        .route("/history/:logical_name", get(jobs::history))
        .nest("/jobs", jobs::router())
}
