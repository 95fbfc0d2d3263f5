//! Core domain errors and failure taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::TaskState;

/// Core domain errors for TaskMesh.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Backend not found.
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskState, to: TaskState },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Reason code carried by an admission rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionCode {
    /// The request is structurally invalid.
    MalformedRequest,
    /// The caller exceeded its token bucket.
    RateLimited,
    /// A policy rule denied the request.
    PolicyDenied,
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MalformedRequest => "MalformedRequest",
            Self::RateLimited => "RateLimited",
            Self::PolicyDenied => "PolicyDenied",
        };
        f.write_str(s)
    }
}

/// Why an admitted task ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// No registered backend matched the task's capability tags in time.
    NoEligibleBackend,
    /// Every dispatch attempt failed.
    BackendExhausted,
    /// The backend reported a terminal (non-retryable) error.
    BackendError,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoEligibleBackend => "NoEligibleBackend",
            Self::BackendExhausted => "BackendExhausted",
            Self::BackendError => "BackendError",
        };
        f.write_str(s)
    }
}
