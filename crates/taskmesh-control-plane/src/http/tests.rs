use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::de::DeserializeOwned;
use tower::ServiceExt;

use taskmesh_core::api::{
    AssignmentMessage, BackendResponse, CancelResponse, OutcomeStatus, RegisterBackendRequest,
    RejectionResponse, ReportOutcomeRequest, StatusResponse, SubmitRequest, SubmitResponse,
    TaskListEntry,
};
use taskmesh_core::{BackendId, CallerId, PolicyRule, Priority, RateLimit, RejectionCode, TaskState};

use super::create_router;
use crate::config::{Config, ConfigHandle};
use crate::state::AppState;

fn submit_body(caller: &str, tags: &[&str]) -> SubmitRequest {
    SubmitRequest {
        task_id: None,
        caller_id: CallerId::new(caller),
        capability_tags: tags.iter().map(|t| t.to_string()).collect(),
        priority: Priority::Normal,
        estimated_duration_ms: 100,
        payload: STANDARD.encode(b"hello"),
    }
}

fn setup(config: Config) -> (Arc<AppState>, Router) {
    let state = AppState::new(ConfigHandle::new(config));
    let router = create_router(state.clone());
    (state, router)
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<String>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json)),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json<T: serde::Serialize>(
    router: &Router,
    method: Method,
    uri: &str,
    body: &T,
) -> (StatusCode, Vec<u8>) {
    send(router, method, uri, Some(serde_json::to_string(body).unwrap())).await
}

fn parse<T: DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).unwrap()
}

async fn wait_for_state(router: &Router, task_id: &str, want: TaskState) -> StatusResponse {
    for _ in 0..100 {
        let (status, body) = send(router, Method::GET, &format!("/v1/tasks/{task_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let snapshot: StatusResponse = parse(&body);
        if snapshot.state == want {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {task_id} never reached {want}");
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_, router) = setup(Config::default());
    let (status, body) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = parse(&body);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_submit_status_and_cancel() {
    let (_, router) = setup(Config::default());

    let (status, body) = send_json(&router, Method::POST, "/v1/tasks", &submit_body("alice", &["x"])).await;
    assert_eq!(status, StatusCode::OK);
    let submitted: SubmitResponse = parse(&body);
    let id = submitted.task_id.to_string();

    let (status, body) = send(&router, Method::GET, &format!("/v1/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let snapshot: StatusResponse = parse(&body);
    assert_eq!(snapshot.state, TaskState::Admitted);
    assert_eq!(snapshot.attempts, 0);

    let (status, body) = send(&router, Method::GET, "/v1/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    let listed: Vec<TaskListEntry> = parse(&body);
    assert_eq!(listed.len(), 1);

    let (status, body) = send(&router, Method::POST, &format!("/v1/tasks/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse::<CancelResponse>(&body).accepted);

    // Already terminal.
    let (_, body) = send(&router, Method::POST, &format!("/v1/tasks/{id}/cancel"), None).await;
    assert!(!parse::<CancelResponse>(&body).accepted);

    let (_, body) = send(&router, Method::GET, &format!("/v1/tasks/{id}"), None).await;
    assert_eq!(parse::<StatusResponse>(&body).state, TaskState::Cancelled);
}

#[tokio::test]
async fn test_unknown_task_is_404() {
    let (_, router) = setup(Config::default());
    let (status, _) = send(&router, Method::GET, "/v1/tasks/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, Method::POST, "/v1/tasks/nope/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_submission_is_400() {
    let (_, router) = setup(Config::default());

    let (status, body) = send(&router, Method::POST, "/v1/tasks", Some("{not json".to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse::<RejectionResponse>(&body).code, RejectionCode::MalformedRequest);

    let mut bad = submit_body("alice", &["x"]);
    bad.estimated_duration_ms = -5;
    let (status, body) = send_json(&router, Method::POST, "/v1/tasks", &bad).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse::<RejectionResponse>(&body).code, RejectionCode::MalformedRequest);
}

#[tokio::test]
async fn test_rate_limited_submission_is_429() {
    let mut config = Config::default();
    if let Some(class) = config.policy.classes.get_mut("standard") {
        class.rate_limit = RateLimit {
            refill_per_sec: 0.001,
            burst: 1,
        };
    }
    let (_, router) = setup(config);

    let (status, _) = send_json(&router, Method::POST, "/v1/tasks", &submit_body("alice", &["x"])).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(&router, Method::POST, "/v1/tasks", &submit_body("alice", &["x"])).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(parse::<RejectionResponse>(&body).code, RejectionCode::RateLimited);

    // Buckets are per caller.
    let (status, _) = send_json(&router, Method::POST, "/v1/tasks", &submit_body("bob", &["x"])).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_policy_denied_submission_is_403() {
    let mut config = Config::default();
    config.policy.rules.push(PolicyRule::DenyTags {
        tags: BTreeSet::from(["gpu".to_string()]),
    });
    let (state, router) = setup(config);

    let (status, body) = send_json(&router, Method::POST, "/v1/tasks", &submit_body("alice", &["gpu"])).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(parse::<RejectionResponse>(&body).code, RejectionCode::PolicyDenied);
    assert!(state.tracker.list().await.is_empty());
}

#[tokio::test]
async fn test_pull_backend_round_trip() {
    let (state, router) = setup(Config::default());

    let register = RegisterBackendRequest {
        id: BackendId::new("pull-1"),
        capability_tags: vec!["x".to_string()],
        capacity: 2,
        labels: HashMap::new(),
    };
    let (status, body) = send_json(&router, Method::POST, "/v1/backends", &register).await;
    assert_eq!(status, StatusCode::OK);
    let backend: BackendResponse = parse(&body);
    assert_eq!(backend.capacity, 2);

    let (status, body) = send_json(
        &router,
        Method::POST,
        "/v1/backends/pull-1/heartbeat",
        &serde_json::json!({ "currentLoad": 0 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = parse(&body);
    assert_eq!(json["health"], serde_json::to_value(backend.health).unwrap());

    let (_, body) = send_json(&router, Method::POST, "/v1/tasks", &submit_body("alice", &["x"])).await;
    let task_id = parse::<SubmitResponse>(&body).task_id;

    let outcome = state.run_tick().await;
    assert_eq!(outcome.assignments.len(), 1);

    let (status, body) = send(
        &router,
        Method::GET,
        "/v1/backends/pull-1/assignments?max=4&wait_ms=500",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let batch: Vec<AssignmentMessage> = parse(&body);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].task_id, task_id);
    assert_eq!(STANDARD.decode(&batch[0].payload).unwrap(), b"hello");

    let report = ReportOutcomeRequest {
        assignment_id: batch[0].assignment_id,
        task_id: task_id.clone(),
        status: OutcomeStatus::Succeeded,
        result: Some("done".to_string()),
        error: None,
        retryable: true,
    };
    let (status, _) = send_json(&router, Method::POST, "/v1/outcomes", &report).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let snapshot = wait_for_state(&router, &task_id.to_string(), TaskState::Succeeded).await;
    assert_eq!(snapshot.result.as_deref(), Some("done"));
    assert_eq!(snapshot.assigned_backend, Some(BackendId::new("pull-1")));

    let (_, body) = send(&router, Method::GET, "/v1/backends", None).await;
    let backends: Vec<BackendResponse> = parse(&body);
    assert_eq!(backends[0].current_load, 0);

    let (status, _) = send(&router, Method::DELETE, "/v1/backends/pull-1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&router, Method::GET, "/v1/backends/pull-1/assignments", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_outcome_for_unknown_assignment_conflicts() {
    let (_, router) = setup(Config::default());
    let report = serde_json::json!({
        "assignmentId": 999,
        "taskId": "ghost",
        "status": "Failed",
        "error": "boom",
    });
    let (status, _) = send_json(&router, Method::POST, "/v1/outcomes", &report).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_backend_errors_map_to_status_codes() {
    let (_, router) = setup(Config::default());

    let (status, _) = send(&router, Method::DELETE, "/v1/backends/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let zero = RegisterBackendRequest {
        id: BackendId::new("b0"),
        capability_tags: vec!["x".to_string()],
        capacity: 0,
        labels: HashMap::new(),
    };
    let (status, _) = send_json(&router, Method::POST, "/v1/backends", &zero).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_and_alerts() {
    let (_, router) = setup(Config::default());
    send_json(&router, Method::POST, "/v1/tasks", &submit_body("alice", &["x"])).await;

    let (status, body) = send(&router, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("taskmesh_queue_depth 1"));

    let (status, body) = send(&router, Method::GET, "/v1/alerts", None).await;
    assert_eq!(status, StatusCode::OK);
    let alerts: Vec<serde_json::Value> = parse(&body);
    assert!(alerts.is_empty());
}

#[tokio::test]
async fn test_reload_without_file_conflicts() {
    let (_, router) = setup(Config::default());
    let (status, _) = send(&router, Method::POST, "/v1/admin/reload", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}
