//! Backend integration surface.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tracing::warn;

use taskmesh_core::api::{
    AssignmentMessage, BackendResponse, HeartbeatRequest, RegisterBackendRequest,
    ReportOutcomeRequest,
};
use taskmesh_core::{Backend, BackendId};

use crate::dispatch::DispatchError;
use crate::http::error_response;
use crate::registry::RegistryError;
use crate::state::AppState;

fn backend_response(b: &Backend) -> BackendResponse {
    BackendResponse {
        id: b.info.id.clone(),
        capability_tags: b.info.capability_tags.iter().cloned().collect(),
        capacity: b.info.capacity,
        current_load: b.current_load,
        health: b.health,
        success_rate: b.success_rate,
        last_heartbeat: b.last_heartbeat,
    }
}

fn registry_error(e: RegistryError) -> axum::response::Response {
    let status = match e {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::InvalidRegistration(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::CONFLICT,
    };
    error_response(status, e.to_string())
}

/// Register a pull-based backend.
pub async fn register_backend(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterBackendRequest>,
) -> impl IntoResponse {
    let id = req.id.clone();
    if let Err(e) = state.register_backend(req).await {
        return registry_error(e);
    }
    match state.registry.get(&id).await {
        Some(backend) => Json(backend_response(&backend)).into_response(),
        None => error_response(StatusCode::CONFLICT, "backend removed during registration"),
    }
}

pub async fn deregister_backend(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.deregister_backend(&BackendId::new(id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => registry_error(e),
    }
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    match state.heartbeat(&BackendId::new(id), req.current_load).await {
        Ok(health) => Json(serde_json::json!({ "health": health })).into_response(),
        Err(e) => registry_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DrainQuery {
    #[serde(default = "default_max")]
    pub max: usize,
    #[serde(default)]
    pub wait_ms: u64,
}

fn default_max() -> usize {
    16
}

/// Drain a backend's mailbox, long-polling up to `wait_ms`.
pub async fn drain_assignments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DrainQuery>,
) -> impl IntoResponse {
    let id = BackendId::new(id);
    let Some(mailbox) = state.mailbox(&id).await else {
        return error_response(StatusCode::NOT_FOUND, format!("no mailbox for backend {id}"));
    };
    let cap = state.config.current().server.max_mailbox_wait_ms;
    let wait = Duration::from_millis(query.wait_ms.min(cap));

    let batch: Vec<AssignmentMessage> = mailbox
        .drain(query.max.max(1), wait)
        .await
        .iter()
        .map(|r| r.to_message())
        .collect();
    Json(batch).into_response()
}

/// Accept a completion report from a backend adapter.
pub async fn report_outcome(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReportOutcomeRequest>,
) -> impl IntoResponse {
    match state.tracker.report_outcome(&req).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e @ DispatchError::TaskMismatch { .. }) => {
            warn!(seq = %req.assignment_id, error = %e, "Outcome rejected");
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => error_response(StatusCode::CONFLICT, e.to_string()),
    }
}

pub async fn list_backends(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backends: Vec<BackendResponse> = state
        .registry
        .list()
        .await
        .iter()
        .map(backend_response)
        .collect();
    Json(backends)
}
