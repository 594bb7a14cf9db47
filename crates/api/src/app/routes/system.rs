use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use jobctl_infra::ControlPlane;

use crate::app::errors;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Job counts by status plus concurrency budget usage.
pub async fn stats(Extension(plane): Extension<Arc<ControlPlane>>) -> axum::response::Response {
    match plane.monitor().stats() {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::monitor_error_to_response(e),
    }
}

pub async fn recurring(Extension(plane): Extension<Arc<ControlPlane>>) -> impl IntoResponse {
    Json(plane.recurring())
}
