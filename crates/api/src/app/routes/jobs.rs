use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, sse::Event as SseEvent},
    routing::{get, post},
};

use jobctl_infra::ControlPlane;

use crate::app::{dto, errors, services};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_active))
        .route("/stream", get(stream))
        .route("/:id", get(get_job))
        .route("/:id/progress", get(get_progress))
        .route("/:id/errors", get(get_errors))
        .route("/:id/cancel", post(cancel_job))
}

pub async fn list_active(Extension(plane): Extension<Arc<ControlPlane>>) -> axum::response::Response {
    match plane.monitor().list_active() {
        Ok(jobs) => (StatusCode::OK, Json(jobs)).into_response(),
        Err(e) => errors::monitor_error_to_response(e),
    }
}

pub async fn stream(
    Extension(plane): Extension<Arc<ControlPlane>>,
) -> axum::response::Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    services::active_jobs_sse_stream(plane)
}

pub async fn get_job(
    Extension(plane): Extension<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match plane.monitor().job(job_id) {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => errors::monitor_error_to_response(e),
    }
}

pub async fn get_progress(
    Extension(plane): Extension<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match plane.monitor().progress(job_id) {
        Ok(progress) => (StatusCode::OK, Json(dto::ProgressResponse { job_id, progress })).into_response(),
        Err(e) => errors::monitor_error_to_response(e),
    }
}

pub async fn get_errors(
    Extension(plane): Extension<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match plane.monitor().errors(job_id) {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => errors::monitor_error_to_response(e),
    }
}

/// Request cancellation. `cancelled: false` means the job was already
/// terminal or the engine refused.
pub async fn cancel_job(
    Extension(plane): Extension<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match plane.monitor().cancel(job_id) {
        Ok(cancelled) => (StatusCode::OK, Json(dto::CancelResponse { job_id, cancelled })).into_response(),
        Err(e) => errors::monitor_error_to_response(e),
    }
}

/// Runs of one logical job, oldest first.
pub async fn history(
    Extension(plane): Extension<Arc<ControlPlane>>,
    Path(logical_name): Path<String>,
    Query(query): Query<dto::HistoryQuery>,
) -> axum::response::Response {
    match plane.monitor().history(&logical_name, query.since) {
        Ok(runs) => (StatusCode::OK, Json(runs)).into_response(),
        Err(e) => errors::monitor_error_to_response(e),
    }
}
