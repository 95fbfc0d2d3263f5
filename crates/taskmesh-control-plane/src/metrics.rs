//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::Arc;

use taskmesh_core::{BackendHealth, TaskState};

use crate::state::AppState;

const TASK_STATES: [(TaskState, &str); 7] = [
    (TaskState::Pending, "pending"),
    (TaskState::Admitted, "admitted"),
    (TaskState::Scheduled, "scheduled"),
    (TaskState::Running, "running"),
    (TaskState::Succeeded, "succeeded"),
    (TaskState::Failed, "failed"),
    (TaskState::Cancelled, "cancelled"),
];

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &Arc<AppState>) -> String {
    let mut output = String::new();

    collect_backend_metrics(state, &mut output).await;
    collect_task_metrics(state, &mut output).await;
    collect_queue_metrics(state, &mut output).await;

    output
}

/// Collect backend metrics by health, plus slot usage.
async fn collect_backend_metrics(state: &Arc<AppState>, output: &mut String) {
    let backends = state.registry.list().await;

    let mut healthy = 0u64;
    let mut degraded = 0u64;
    let mut quarantined = 0u64;
    let mut load = 0u64;
    let mut capacity = 0u64;

    for backend in &backends {
        match backend.health {
            BackendHealth::Healthy => healthy += 1,
            BackendHealth::Degraded => degraded += 1,
            BackendHealth::Quarantined => quarantined += 1,
        }
        load += u64::from(backend.current_load);
        capacity += u64::from(backend.capacity());
    }

    writeln!(
        output,
        "# HELP taskmesh_backends Number of registered backends by health"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_backends gauge").ok();
    writeln!(output, "taskmesh_backends{{health=\"healthy\"}} {healthy}").ok();
    writeln!(output, "taskmesh_backends{{health=\"degraded\"}} {degraded}").ok();
    writeln!(
        output,
        "taskmesh_backends{{health=\"quarantined\"}} {quarantined}"
    )
    .ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_backend_slots Reserved and total backend slots"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_backend_slots gauge").ok();
    writeln!(output, "taskmesh_backend_slots{{kind=\"reserved\"}} {load}").ok();
    writeln!(output, "taskmesh_backend_slots{{kind=\"capacity\"}} {capacity}").ok();
}

/// Collect task metrics by state.
async fn collect_task_metrics(state: &Arc<AppState>, output: &mut String) {
    let tasks = state.tracker.list().await;

    let mut counts = [0u64; TASK_STATES.len()];
    for task in &tasks {
        if let Some(i) = TASK_STATES.iter().position(|(s, _)| *s == task.state) {
            counts[i] += 1;
        }
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_tasks_total Total number of tasks by state"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_tasks_total gauge").ok();
    for ((_, label), count) in TASK_STATES.iter().zip(counts) {
        writeln!(output, "taskmesh_tasks_total{{state=\"{label}\"}} {count}").ok();
    }
}

async fn collect_queue_metrics(state: &Arc<AppState>, output: &mut String) {
    let queued = state.scheduler.queue_len().await;
    let in_flight = state.tracker.in_flight_len().await;

    writeln!(output).ok();
    writeln!(output, "# HELP taskmesh_queue_depth Tasks waiting for a slot").ok();
    writeln!(output, "# TYPE taskmesh_queue_depth gauge").ok();
    writeln!(output, "taskmesh_queue_depth {queued}").ok();
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_assignments_in_flight Assignments held by dispatch workers"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_assignments_in_flight gauge").ok();
    writeln!(output, "taskmesh_assignments_in_flight {in_flight}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigHandle};

    #[tokio::test]
    async fn test_collect_metrics_empty_state() {
        let state = AppState::new(ConfigHandle::new(Config::default()));
        let output = collect_metrics(&state).await;

        assert!(output.contains("taskmesh_backends{health=\"healthy\"} 0"));
        assert!(output.contains("taskmesh_tasks_total{state=\"pending\"} 0"));
        assert!(output.contains("taskmesh_queue_depth 0"));
    }

    #[tokio::test]
    async fn test_collect_metrics_counts_tasks() {
        use base64::{engine::general_purpose::STANDARD, Engine};
        use taskmesh_core::api::SubmitRequest;
        use taskmesh_core::{CallerId, Priority};

        let state = AppState::new(ConfigHandle::new(Config::default()));
        for _ in 0..2 {
            state
                .submit(SubmitRequest {
                    task_id: None,
                    caller_id: CallerId::new("alice"),
                    capability_tags: vec!["x".to_string()],
                    priority: Priority::Normal,
                    estimated_duration_ms: 10,
                    payload: STANDARD.encode(b""),
                })
                .await
                .unwrap();
        }

        let output = collect_metrics(&state).await;
        assert!(output.contains("taskmesh_tasks_total{state=\"admitted\"} 2"));
        assert!(output.contains("taskmesh_queue_depth 2"));
    }
}
