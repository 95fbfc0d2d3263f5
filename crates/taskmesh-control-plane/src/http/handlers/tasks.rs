//! Task submission surface.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use taskmesh_core::api::{
    CancelResponse, StatusResponse, SubmitRequest, SubmitResponse, TaskListEntry,
};
use taskmesh_core::{RejectionCode, TaskId};

use crate::admission::Rejection;
use crate::http::error_response;
use crate::state::AppState;

fn rejection_status(code: RejectionCode) -> StatusCode {
    match code {
        RejectionCode::MalformedRequest => StatusCode::BAD_REQUEST,
        RejectionCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        RejectionCode::PolicyDenied => StatusCode::FORBIDDEN,
    }
}

/// Submit a task.
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> impl IntoResponse {
    let result = match body {
        Ok(Json(req)) => state.submit(req).await,
        Err(e) => Err(Rejection::malformed(e.body_text())),
    };

    match result {
        Ok(task_id) => (StatusCode::OK, Json(SubmitResponse { task_id })).into_response(),
        Err(rejection) => (
            rejection_status(rejection.code),
            Json(rejection.to_response()),
        )
            .into_response(),
    }
}

/// Task status.
pub async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.tracker.status(&TaskId::new(id)).await {
        Ok(snapshot) => Json(StatusResponse {
            task_id: snapshot.task_id,
            state: snapshot.state,
            assigned_backend: snapshot.assigned_backend,
            result: snapshot.result,
            error: snapshot.error,
            attempts: snapshot.attempts,
        })
        .into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e.to_string()),
    }
}

/// List every known task.
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tasks: Vec<TaskListEntry> = state
        .tracker
        .list()
        .await
        .into_iter()
        .map(|t| TaskListEntry {
            task_id: t.task_id,
            caller_id: t.caller_id,
            state: t.state,
            priority: t.priority,
            submitted_at: t.submitted_at,
            assigned_backend: t.assigned_backend,
        })
        .collect();
    Json(tasks)
}

/// Cancel a task. Terminal tasks answer `accepted: false`.
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let task_id = TaskId::new(id);
    if let Err(e) = state.tracker.status(&task_id).await {
        return error_response(StatusCode::NOT_FOUND, e.to_string());
    }
    let accepted = state.tracker.cancel(&task_id).await;
    Json(CancelResponse { accepted }).into_response()
}
