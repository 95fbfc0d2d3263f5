//! Request and response bodies for the submission and backend surfaces.
//!
//! Payload bytes travel base64-encoded; decoding happens at the edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{
    AssignmentSeq, BackendHealth, BackendId, CallerId, Priority, RejectionCode, TaskError, TaskId,
    TaskState,
};

// ============================================================================
// Task submission surface
// ============================================================================

/// Body of `POST /v1/tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Optional caller-supplied id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub caller_id: CallerId,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    pub estimated_duration_ms: i64,
    /// Base64 payload.
    #[serde(default)]
    pub payload: String,
}

/// Successful submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub task_id: TaskId,
}

/// Synchronous admission rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionResponse {
    pub code: RejectionCode,
    pub message: String,
}

/// Body of `GET /v1/tasks/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_backend: Option<BackendId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub attempts: u32,
}

/// Body of `POST /v1/tasks/{id}/cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub accepted: bool,
}

/// Generic error body for lookups and backend calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Backend integration surface
// ============================================================================

/// Body of `POST /v1/backends`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBackendRequest {
    pub id: BackendId,
    pub capability_tags: Vec<String>,
    pub capacity: u32,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Body of `POST /v1/backends/{id}/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub current_load: u32,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Outcome kind reported by a backend adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
}

/// Body of `POST /v1/outcomes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutcomeRequest {
    pub assignment_id: AssignmentSeq,
    pub task_id: TaskId,
    pub status: OutcomeStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Whether a failure may be retried elsewhere.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

/// Work item drained from a backend mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentMessage {
    pub assignment_id: AssignmentSeq,
    pub task_id: TaskId,
    pub attempt: u32,
    pub estimated_duration_ms: u64,
    /// Base64 payload.
    pub payload: String,
    /// Probe tasks carry no payload and exist only to test liveness.
    pub probe: bool,
}

/// Entry in `GET /v1/backends`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendResponse {
    pub id: BackendId,
    pub capability_tags: Vec<String>,
    pub capacity: u32,
    pub current_load: u32,
    pub health: BackendHealth,
    pub success_rate: f64,
    pub last_heartbeat: DateTime<Utc>,
}

/// Entry in `GET /v1/alerts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertResponse {
    pub kind: String,
    pub subject: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Used by `GET /v1/tasks` to echo the submitting caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListEntry {
    pub task_id: TaskId,
    pub caller_id: CallerId,
    pub state: TaskState,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_backend: Option<BackendId>,
}
