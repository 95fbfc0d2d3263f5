//! Test executors.

use std::sync::Mutex;

use async_trait::async_trait;

use taskmesh_core::{AssignmentSeq, TaskId};

use super::{BackendExecutor, DispatchError, DispatchRequest};

#[derive(Debug, Clone, Copy)]
pub(crate) enum ExecMode {
    Accept,
    Reject,
    Hang,
}

/// Executor whose acceptance behaviour is fixed up front and which records
/// every request it sees.
pub(crate) struct ScriptedExecutor {
    mode: ExecMode,
    honor_cancel: bool,
    requests: Mutex<Vec<DispatchRequest>>,
    cancels: Mutex<Vec<AssignmentSeq>>,
}

impl ScriptedExecutor {
    pub(crate) fn new(mode: ExecMode) -> Self {
        Self {
            mode,
            honor_cancel: true,
            requests: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn accepting() -> Self {
        Self::new(ExecMode::Accept)
    }

    pub(crate) fn rejecting() -> Self {
        Self::new(ExecMode::Reject)
    }

    pub(crate) fn hanging() -> Self {
        Self::new(ExecMode::Hang)
    }

    pub(crate) fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn executions(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn cancels(&self) -> Vec<AssignmentSeq> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendExecutor for ScriptedExecutor {
    async fn execute(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        self.requests.lock().unwrap().push(request);
        match self.mode {
            ExecMode::Accept => Ok(()),
            ExecMode::Reject => Err(DispatchError::Unavailable("scripted rejection".into())),
            ExecMode::Hang => std::future::pending().await,
        }
    }

    async fn cancel(&self, _task_id: &TaskId, seq: AssignmentSeq) -> bool {
        self.cancels.lock().unwrap().push(seq);
        self.honor_cancel
    }
}
