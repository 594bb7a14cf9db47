use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use jobctl_core::JobId;
use jobctl_infra::{MonitorError, StoreError};

pub fn monitor_error_to_response(err: MonitorError) -> axum::response::Response {
    match err {
        MonitorError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}"))
        }
        MonitorError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        StoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}"))
        }
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        e @ StoreError::ActiveJob { .. } => {
            json_error(StatusCode::CONFLICT, "duplicate", e.to_string())
        }
        StoreError::Domain(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        e => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            e.to_string(),
        ),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_job_id", e.to_string()))
}
