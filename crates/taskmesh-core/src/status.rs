//! Status enums for Tasks and Backends, plus task priority classes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a Task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Task record created by admission, not yet queued.
    #[default]
    Pending,
    /// Task accepted into the scheduler queue, waiting for a backend slot.
    Admitted,
    /// Task paired with a backend (or waiting out a retry backoff).
    Scheduled,
    /// Backend accepted the dispatch and is executing.
    Running,
    /// Task completed successfully.
    Succeeded,
    /// Task failed terminally.
    Failed,
    /// Task was cancelled by the caller.
    Cancelled,
}

impl TaskState {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if `next` is a legal edge from this state.
    ///
    /// Transitions move forward only, with the single exception of
    /// `Running -> Scheduled` on retry. `Pending` can never jump straight to
    /// a terminal outcome other than cancellation.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Admitted)
                | (Pending, Cancelled)
                | (Admitted, Scheduled)
                | (Admitted, Failed)
                | (Admitted, Cancelled)
                | (Scheduled, Running)
                | (Scheduled, Failed)
                | (Scheduled, Cancelled)
                | (Running, Scheduled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Health of an execution backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendHealth {
    /// Backend is heartbeating and succeeding.
    #[default]
    Healthy,
    /// Backend missed heartbeats; still eligible for assignments.
    Degraded,
    /// Backend is excluded from scheduling until recovered.
    Quarantined,
}

impl BackendHealth {
    /// Returns true if the backend can accept new assignments.
    pub fn can_accept_tasks(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Priority class of a task. Classes are bounded; ordering is `Low < Normal < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// All classes from highest to lowest.
    pub const DESCENDING: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// The next class up, saturating at `High`.
    pub fn promoted(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal | Self::High => Self::High,
        }
    }

    /// Dense index, `Low = 0`.
    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_is_the_only_backward_edge() {
        assert!(TaskState::Running.can_transition_to(TaskState::Scheduled));
        assert!(!TaskState::Scheduled.can_transition_to(TaskState::Admitted));
        assert!(!TaskState::Succeeded.can_transition_to(TaskState::Running));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Cancelled));
    }

    #[test]
    fn test_pending_never_reaches_outcome_directly() {
        assert!(!TaskState::Pending.can_transition_to(TaskState::Succeeded));
        assert!(!TaskState::Pending.can_transition_to(TaskState::Failed));
        assert!(TaskState::Pending.can_transition_to(TaskState::Cancelled));
    }

    #[test]
    fn test_quarantined_backend_rejects_tasks() {
        assert!(BackendHealth::Healthy.can_accept_tasks());
        assert!(BackendHealth::Degraded.can_accept_tasks());
        assert!(!BackendHealth::Quarantined.can_accept_tasks());
    }

    #[test]
    fn test_priority_promotion_saturates() {
        assert_eq!(Priority::Low.promoted(), Priority::Normal);
        assert_eq!(Priority::High.promoted(), Priority::High);
        assert!(Priority::High > Priority::Low);
    }
}
