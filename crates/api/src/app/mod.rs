//! HTTP dashboard application wiring (Axum router + control plane wiring).
//!
//! - `services.rs`: builds the `ControlPlane` (store selection, engine) and the live job stream
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: query/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use jobctl_infra::ControlPlane;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(plane: ControlPlane) -> Router {
    let plane = Arc::new(plane);

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(Extension(plane))
        .layer(ServiceBuilder::new())
}
