//! Resilience subsystem.
//!
//! Three independent loops, composed over the shared registry handle:
//! - [`AnomalyDetector`] watches admission outcomes per caller and tightens
//!   or denies abusive callers.
//! - [`HealthRelay`] turns dispatch outcomes and heartbeat silence into
//!   backend health transitions.
//! - [`RecoveryProber`] probes quarantined backends and restores them.
//!
//! All three report through the [`AlertHub`].

mod anomaly;
mod health;
mod recovery;

pub use anomaly::{AnomalyAction, AnomalyDetector};
pub use health::HealthRelay;
pub use recovery::RecoveryProber;

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use taskmesh_core::api::AlertResponse;
use taskmesh_core::{AssignmentSeq, BackendId, CallerId, RejectionCode, TaskId};

/// Alert categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    RateTightened,
    CallerDenied,
    BackendDegraded,
    BackendQuarantined,
    BackendRestored,
    DispatchTimeout,
    InvariantViolation,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    /// Caller or backend the alert is about.
    pub subject: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, subject: impl fmt::Display, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.to_string(),
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn to_response(&self) -> AlertResponse {
        AlertResponse {
            kind: self.kind.to_string(),
            subject: self.subject.clone(),
            message: self.message.clone(),
            raised_at: self.raised_at,
        }
    }
}

/// Shared alert channel plus a bounded history.
pub struct AlertHub {
    tx: broadcast::Sender<Alert>,
    recent: Mutex<VecDeque<Alert>>,
    history: usize,
}

impl AlertHub {
    pub fn new(history: usize) -> Self {
        let (tx, _rx) = broadcast::channel(history.max(16));
        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(history)),
            history,
        }
    }

    pub async fn raise(&self, alert: Alert) {
        warn!(
            kind = %alert.kind,
            subject = %alert.subject,
            message = %alert.message,
            "Alert raised"
        );
        {
            let mut recent = self.recent.lock().await;
            if recent.len() >= self.history {
                recent.pop_front();
            }
            if self.history > 0 {
                recent.push_back(alert.clone());
            }
        }
        // No subscribers is fine.
        let _ = self.tx.send(alert);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Retained alerts, oldest first.
    pub async fn recent(&self) -> Vec<Alert> {
        self.recent.lock().await.iter().cloned().collect()
    }
}

/// Per-dispatch signal from the lifecycle tracker.
#[derive(Debug, Clone)]
pub enum HealthSignal {
    Outcome {
        backend_id: BackendId,
        success: bool,
        consecutive_failures: u32,
    },
    Timeout {
        backend_id: BackendId,
        task_id: TaskId,
        seq: AssignmentSeq,
    },
}

/// Per-submission signal from the admission controller.
#[derive(Debug, Clone)]
pub struct AdmissionSignal {
    pub caller_id: CallerId,
    pub rejected: Option<RejectionCode>,
}
