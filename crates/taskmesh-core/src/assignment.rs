//! Task-to-backend assignment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AssignmentSeq, BackendId, TaskId};

/// A committed pairing of one task to one backend slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Sequence number; also the registry reservation token.
    pub seq: AssignmentSeq,

    pub task_id: TaskId,

    pub backend_id: BackendId,

    /// 1-based dispatch attempt this assignment represents.
    pub attempt: u32,

    pub created_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(seq: AssignmentSeq, task_id: TaskId, backend_id: BackendId, attempt: u32) -> Self {
        Self {
            seq,
            task_id,
            backend_id,
            attempt,
            created_at: Utc::now(),
        }
    }
}
