//! Task and payload descriptor types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{BackendId, CallerId, CoreError, FailureReason, Priority, TaskId, TaskState};

/// Payload descriptor: the opaque work blob plus its declared requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Capability tags a backend must carry to run this task.
    pub capability_tags: BTreeSet<String>,

    /// Priority class.
    pub priority: Priority,

    /// Caller's estimate of execution time.
    pub estimated_duration_ms: u64,

    /// Opaque work payload.
    pub payload: Vec<u8>,
}

impl TaskSpec {
    /// Create a new TaskSpec with the given tags and defaults elsewhere.
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capability_tags: tags.into_iter().map(Into::into).collect(),
            priority: Priority::Normal,
            estimated_duration_ms: 1_000,
            payload: Vec::new(),
        }
    }

    /// Builder method to set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set the estimated duration.
    pub fn with_estimated_duration_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = ms;
        self
    }

    /// Builder method to set the payload.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Terminal error recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub reason: FailureReason,
    pub message: String,
}

impl TaskError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// A Task is a unit of work submitted for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Who submitted the task.
    pub caller_id: CallerId,

    /// Payload descriptor.
    pub spec: TaskSpec,

    /// When the task was submitted.
    pub submitted_at: DateTime<Utc>,

    /// Current lifecycle state.
    pub state: TaskState,

    /// Backend currently holding the task, if any.
    pub assigned_backend: Option<BackendId>,

    /// Number of dispatch attempts made so far.
    pub attempts: u32,

    /// Result reported by the backend.
    pub result: Option<String>,

    /// Terminal error.
    pub error: Option<TaskError>,

    /// Most recent underlying dispatch error, kept across retries.
    pub last_error: Option<String>,

    /// Set once a cancel was requested while a backend held the task.
    pub cancel_requested: bool,
}

impl Task {
    /// Create a new Task in state `Pending`.
    pub fn new(caller_id: CallerId, spec: TaskSpec) -> Self {
        Self {
            id: TaskId::generate(),
            caller_id,
            spec,
            submitted_at: Utc::now(),
            state: TaskState::Pending,
            assigned_backend: None,
            attempts: 0,
            result: None,
            error: None,
            last_error: None,
            cancel_requested: false,
        }
    }

    /// Builder method to set a specific ID.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Move to `next`, rejecting edges the lifecycle does not allow.
    pub fn transition(&mut self, next: TaskState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Read-only view handed to callers.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            caller_id: self.caller_id.clone(),
            state: self.state,
            priority: self.spec.priority,
            submitted_at: self.submitted_at,
            assigned_backend: self.assigned_backend.clone(),
            attempts: self.attempts,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Read-only snapshot of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub caller_id: CallerId,
    pub state: TaskState,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    pub assigned_backend: Option<BackendId>,
    pub attempts: u32,
    pub result: Option<String>,
    pub error: Option<TaskError>,
}
