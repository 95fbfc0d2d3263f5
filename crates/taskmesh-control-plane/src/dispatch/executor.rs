//! Backend executor seam.
//!
//! Each backend technology plugs in through [`BackendExecutor`]. `execute`
//! only reports whether the backend accepted the work; the outcome arrives
//! later through the lifecycle tracker's `report_outcome`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use taskmesh_core::api::AssignmentMessage;
use taskmesh_core::{AssignmentSeq, TaskId};

/// Errors that can occur while dispatching to a backend.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Backend rejected dispatch: {0}")]
    Rejected(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Dispatch timed out")]
    Timeout,

    #[error("Backend reported failure: {0}")]
    Failed(String),

    #[error("Backend reported terminal error: {0}")]
    Terminal(String),

    #[error("Unknown assignment: {0}")]
    UnknownAssignment(AssignmentSeq),

    #[error("Assignment {seq} belongs to task {expected}, not {got}")]
    TaskMismatch {
        seq: AssignmentSeq,
        expected: TaskId,
        got: TaskId,
    },
}

impl DispatchError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::Unavailable(_) | Self::Timeout | Self::Failed(_)
        )
    }
}

/// Work handed to a backend.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub seq: AssignmentSeq,
    pub task_id: TaskId,
    pub attempt: u32,
    pub estimated_duration_ms: u64,
    pub payload: Vec<u8>,
    pub probe: bool,
}

impl DispatchRequest {
    /// A payload-free liveness probe.
    pub fn probe(seq: AssignmentSeq) -> Self {
        Self {
            seq,
            task_id: TaskId::new(format!("probe-{seq}")),
            attempt: 1,
            estimated_duration_ms: 0,
            payload: Vec::new(),
            probe: true,
        }
    }

    /// Wire form for HTTP adapters.
    pub fn to_message(&self) -> AssignmentMessage {
        AssignmentMessage {
            assignment_id: self.seq,
            task_id: self.task_id.clone(),
            attempt: self.attempt,
            estimated_duration_ms: self.estimated_duration_ms,
            payload: STANDARD.encode(&self.payload),
            probe: self.probe,
        }
    }
}

/// Uniform contract every backend adapter implements.
#[async_trait]
pub trait BackendExecutor: Send + Sync {
    /// Hand work to the backend. Returns once the backend accepted it.
    async fn execute(&self, request: DispatchRequest) -> Result<(), DispatchError>;

    /// Best-effort cancellation. Returns true if the backend honoured it.
    async fn cancel(&self, task_id: &TaskId, seq: AssignmentSeq) -> bool;
}

/// Executor for backends that pull their work over HTTP.
///
/// Accepted requests wait in a mailbox until the adapter drains them.
#[derive(Default)]
pub struct MailboxExecutor {
    pending: Mutex<VecDeque<DispatchRequest>>,
    notify: Notify,
}

impl MailboxExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take up to `max` queued requests, waiting up to `wait` for the first.
    pub async fn drain(&self, max: usize, wait: Duration) -> Vec<DispatchRequest> {
        let batch = self.take(max).await;
        if !batch.is_empty() || wait.is_zero() {
            return batch;
        }
        // notify_one leaves a permit behind, so a push racing this wait is not lost
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.take(max).await
    }

    async fn take(&self, max: usize) -> Vec<DispatchRequest> {
        let mut pending = self.pending.lock().await;
        let n = max.min(pending.len());
        pending.drain(..n).collect()
    }

    /// Number of undelivered requests.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BackendExecutor for MailboxExecutor {
    async fn execute(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        debug!(seq = %request.seq, task_id = %request.task_id, "Queued in backend mailbox");
        self.pending.lock().await.push_back(request);
        self.notify.notify_one();
        Ok(())
    }

    async fn cancel(&self, _task_id: &TaskId, seq: AssignmentSeq) -> bool {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|r| r.seq != seq);
        // Only undelivered work can be withdrawn.
        pending.len() < before
    }
}
