//! Health, metrics, alerts and admin handlers.

use std::sync::Arc;

use axum::{extract::State, http::header, http::StatusCode, response::IntoResponse, Json};

use taskmesh_core::api::AlertResponse;

use crate::config::ConfigError;
use crate::http::error_response;
use crate::state::AppState;

/// Health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&state).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

/// Recent alerts, oldest first.
pub async fn list_alerts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let alerts: Vec<AlertResponse> = state
        .alerts
        .recent()
        .await
        .iter()
        .map(|a| a.to_response())
        .collect();
    Json(alerts)
}

/// Re-read the config file now.
pub async fn reload_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.config.reload().await {
        Ok(()) => Json(serde_json::json!({ "status": "reloaded" })).into_response(),
        Err(e @ ConfigError::NoFile) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}
