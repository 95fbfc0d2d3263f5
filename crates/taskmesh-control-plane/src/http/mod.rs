//! HTTP server for the control plane.
//!
//! Provides endpoints for:
//! - Task submission, status, listing and cancellation (`/v1/tasks`)
//! - Backend registration, heartbeats, mailbox and outcomes (`/v1/backends`, `/v1/outcomes`)
//! - Alerts (`/v1/alerts`) and config reload (`/v1/admin/reload`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use taskmesh_core::api::ErrorResponse;

use crate::state::AppState;

mod handlers;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Submission surface
        .route(
            "/v1/tasks",
            post(handlers::submit_task).get(handlers::list_tasks),
        )
        .route("/v1/tasks/:id", get(handlers::task_status))
        .route("/v1/tasks/:id/cancel", post(handlers::cancel_task))
        // Backend integration surface
        .route(
            "/v1/backends",
            post(handlers::register_backend).get(handlers::list_backends),
        )
        .route("/v1/backends/:id", delete(handlers::deregister_backend))
        .route("/v1/backends/:id/heartbeat", post(handlers::heartbeat))
        .route("/v1/backends/:id/assignments", get(handlers::drain_assignments))
        .route("/v1/outcomes", post(handlers::report_outcome))
        // Operations
        .route("/v1/alerts", get(handlers::list_alerts))
        .route("/v1/admin/reload", post(handlers::reload_config))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub(crate) fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests;
