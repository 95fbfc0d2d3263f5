//! Dispatch & lifecycle tracking.
//!
//! The tracker owns every admitted [`Task`]. `dispatch` hands an assignment
//! to a per-assignment worker and returns immediately; the worker calls the
//! backend executor, enforces the completion deadline with the monotonic
//! clock, and waits for the outcome the backend reports through
//! [`LifecycleTracker::report_outcome`].
//!
//! The assignment sequence number is the idempotency token: it is the
//! registry reservation key, and the tracker refuses to dispatch a sequence
//! number that is already in flight or whose reservation is gone.

mod backoff;
pub mod executor;
#[cfg(test)]
pub(crate) mod testing;

pub use backoff::retry_delay;
pub use executor::{BackendExecutor, DispatchError, DispatchRequest, MailboxExecutor};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskmesh_core::api::{OutcomeStatus, ReportOutcomeRequest};
use taskmesh_core::{
    Assignment, AssignmentSeq, BackendId, CoreError, FailureReason, Task, TaskError, TaskId,
    TaskSnapshot, TaskState,
};

use crate::config::ConfigHandle;
use crate::registry::{BackendRegistry, Reservation};
use crate::resilience::HealthSignal;
use crate::scheduler::{QueuedTask, Scheduler, SeqGenerator};

/// Result of handing an assignment to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAck {
    /// A worker now owns the assignment.
    Accepted,
    /// This sequence number is already in flight; nothing was executed.
    Duplicate,
    /// The reservation or the task is gone; nothing was executed.
    Stale,
}

/// Completion signal for one assignment.
#[derive(Debug, Clone)]
pub enum Completion {
    Succeeded(Option<String>),
    Failed { error: String, retryable: bool },
}

impl Completion {
    fn into_result(self) -> Result<Option<String>, DispatchError> {
        match self {
            Self::Succeeded(result) => Ok(result),
            Self::Failed {
                error,
                retryable: true,
            } => Err(DispatchError::Failed(error)),
            Self::Failed {
                error,
                retryable: false,
            } => Err(DispatchError::Terminal(error)),
        }
    }
}

impl From<&ReportOutcomeRequest> for Completion {
    fn from(req: &ReportOutcomeRequest) -> Self {
        match req.status {
            OutcomeStatus::Succeeded => Self::Succeeded(req.result.clone()),
            OutcomeStatus::Failed => Self::Failed {
                error: req
                    .error
                    .clone()
                    .unwrap_or_else(|| "unspecified failure".to_string()),
                retryable: req.retryable,
            },
        }
    }
}

struct TaskRecord {
    task: Task,
    /// Assignment currently responsible for the task.
    current_seq: Option<AssignmentSeq>,
}

struct InFlight {
    task_id: TaskId,
    backend_id: BackendId,
    attempt: u32,
    completion: Option<oneshot::Sender<Completion>>,
    cancel: CancellationToken,
}

/// Assignments the tracker still answers for.
#[derive(Debug, Default)]
pub struct LiveAssignments {
    /// Dispatched and not yet settled.
    seqs: HashSet<AssignmentSeq>,
    /// Open tasks with no dispatched assignment; a reservation made for one
    /// of these is waiting for its dispatch.
    awaiting: HashSet<TaskId>,
}

impl LiveAssignments {
    pub fn holds(&self, reservation: &Reservation) -> bool {
        self.seqs.contains(&reservation.seq) || self.awaiting.contains(&reservation.task_id)
    }
}

/// Tracks tasks from admission to a terminal state.
pub struct LifecycleTracker {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    in_flight: Mutex<HashMap<AssignmentSeq, InFlight>>,
    probes: Mutex<HashMap<AssignmentSeq, oneshot::Sender<Completion>>>,
    registry: Arc<BackendRegistry>,
    scheduler: Arc<Scheduler>,
    config: ConfigHandle,
    signals: mpsc::Sender<HealthSignal>,
    seq: SeqGenerator,
}

impl LifecycleTracker {
    pub fn new(
        registry: Arc<BackendRegistry>,
        scheduler: Arc<Scheduler>,
        config: ConfigHandle,
        seq: SeqGenerator,
        signals: mpsc::Sender<HealthSignal>,
    ) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            registry,
            scheduler,
            config,
            signals,
            seq,
        }
    }

    /// Take ownership of a freshly admitted task and queue it.
    pub async fn track(&self, mut task: Task) -> Result<TaskId, CoreError> {
        let task_id = task.id.clone();
        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&task_id) {
                return Err(CoreError::InvalidInput(format!(
                    "task id {task_id} already exists"
                )));
            }
            task.transition(TaskState::Admitted)?;
            let entry = QueuedTask::from_task(&task);
            tasks.insert(
                task_id.clone(),
                TaskRecord {
                    task,
                    current_seq: None,
                },
            );
            self.scheduler.enqueue(entry).await;
        }
        info!(task_id = %task_id, "Task admitted");
        Ok(task_id)
    }

    /// Hand an assignment to a dispatch worker. Never blocks on the backend.
    pub async fn dispatch(self: &Arc<Self>, assignment: Assignment) -> DispatchAck {
        let seq = assignment.seq;
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains_key(&seq) {
            debug!(seq = %seq, task_id = %assignment.task_id, "Duplicate dispatch ignored");
            return DispatchAck::Duplicate;
        }
        if !self.registry.is_reserved(seq).await {
            warn!(seq = %seq, task_id = %assignment.task_id, "Dispatch without reservation ignored");
            return DispatchAck::Stale;
        }

        let request = {
            let mut tasks = self.tasks.write().await;
            let prepared = tasks
                .get_mut(&assignment.task_id)
                .ok_or_else(|| CoreError::TaskNotFound(assignment.task_id.to_string()))
                .and_then(|record| {
                    if record.task.state != TaskState::Scheduled {
                        record.task.transition(TaskState::Scheduled)?;
                    }
                    record.task.assigned_backend = Some(assignment.backend_id.clone());
                    record.task.attempts = assignment.attempt;
                    record.current_seq = Some(seq);
                    Ok(DispatchRequest {
                        seq,
                        task_id: assignment.task_id.clone(),
                        attempt: assignment.attempt,
                        estimated_duration_ms: record.task.spec.estimated_duration_ms,
                        payload: record.task.spec.payload.clone(),
                        probe: false,
                    })
                });
            match prepared {
                Ok(request) => request,
                Err(e) => {
                    drop(tasks);
                    drop(in_flight);
                    debug!(seq = %seq, error = %e, "Assignment no longer applicable");
                    self.registry.release(seq).await;
                    return DispatchAck::Stale;
                }
            }
        };

        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        in_flight.insert(
            seq,
            InFlight {
                task_id: assignment.task_id.clone(),
                backend_id: assignment.backend_id.clone(),
                attempt: assignment.attempt,
                completion: Some(tx),
                cancel: cancel.clone(),
            },
        );
        drop(in_flight);
        info!(
            task_id = %assignment.task_id,
            backend_id = %assignment.backend_id,
            seq = %seq,
            attempt = assignment.attempt,
            "Task scheduled"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_assignment(assignment.backend_id, request, rx, cancel)
                .await;
        });
        DispatchAck::Accepted
    }

    async fn run_assignment(
        self: Arc<Self>,
        backend_id: BackendId,
        request: DispatchRequest,
        mut completion: oneshot::Receiver<Completion>,
        cancel: CancellationToken,
    ) {
        let seq = request.seq;
        let task_id = request.task_id.clone();
        let deadline = Instant::now()
            + self
                .config
                .current()
                .dispatch
                .deadline_for(request.estimated_duration_ms);

        let Some(executor) = self.registry.executor(&backend_id).await else {
            self.finish_attempt(seq, Err(DispatchError::Unavailable(backend_id.to_string())))
                .await;
            return;
        };

        let early = tokio::select! {
            _ = cancel.cancelled() => return,
            done = &mut completion => Some(done),
            accepted = tokio::time::timeout_at(deadline, executor.execute(request)) => {
                match accepted {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => {
                        self.finish_attempt(seq, Err(e)).await;
                        return;
                    }
                    Err(_) => {
                        self.on_timeout(seq, &task_id, &backend_id).await;
                        return;
                    }
                }
            }
        };

        let done = match early {
            Some(done) => done,
            None => {
                self.mark_running(seq, &task_id).await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    done = tokio::time::timeout_at(deadline, &mut completion) => match done {
                        Ok(done) => done,
                        Err(_) => {
                            self.on_timeout(seq, &task_id, &backend_id).await;
                            return;
                        }
                    },
                }
            }
        };

        // A dropped sender means the assignment was withdrawn.
        if let Ok(done) = done {
            self.finish_attempt(seq, done.into_result()).await;
        }
    }

    async fn mark_running(&self, seq: AssignmentSeq, task_id: &TaskId) {
        let mut tasks = self.tasks.write().await;
        let Some(record) = tasks.get_mut(task_id) else {
            return;
        };
        if record.current_seq == Some(seq) && record.task.state == TaskState::Scheduled {
            if let Err(e) = record.task.transition(TaskState::Running) {
                error!(task_id = %task_id, error = %e, "Lifecycle violation");
                return;
            }
            info!(task_id = %task_id, seq = %seq, "Task running");
        }
    }

    async fn on_timeout(&self, seq: AssignmentSeq, task_id: &TaskId, backend_id: &BackendId) {
        warn!(task_id = %task_id, backend_id = %backend_id, seq = %seq, "Dispatch timed out");
        self.emit(HealthSignal::Timeout {
            backend_id: backend_id.clone(),
            task_id: task_id.clone(),
            seq,
        })
        .await;
        if let Some(executor) = self.registry.executor(backend_id).await {
            let task_id = task_id.clone();
            tokio::spawn(async move {
                executor.cancel(&task_id, seq).await;
            });
        }
        self.finish_attempt(seq, Err(DispatchError::Timeout)).await;
    }

    /// Settle one assignment: free the slot, feed backend statistics, then
    /// complete, fail, or requeue the task.
    async fn finish_attempt(&self, seq: AssignmentSeq, result: Result<Option<String>, DispatchError>) {
        let Some(flight) = self.in_flight.lock().await.remove(&seq) else {
            return;
        };
        self.registry.release(seq).await;

        let success = result.is_ok();
        if let Some(failures) = self.registry.record_outcome(&flight.backend_id, success).await {
            self.emit(HealthSignal::Outcome {
                backend_id: flight.backend_id.clone(),
                success,
                consecutive_failures: failures,
            })
            .await;
        }

        let retry = self.config.current().dispatch.retry.clone();
        let mut requeue = None;
        {
            let mut tasks = self.tasks.write().await;
            let Some(record) = tasks.get_mut(&flight.task_id) else {
                return;
            };
            if record.current_seq != Some(seq) || record.task.is_terminal() {
                return;
            }
            record.current_seq = None;
            let task = &mut record.task;

            let applied = match result {
                Ok(output) => {
                    let step = if task.state == TaskState::Scheduled {
                        task.transition(TaskState::Running)
                    } else {
                        Ok(())
                    };
                    step.and_then(|_| task.transition(TaskState::Succeeded))
                        .map(|_| {
                            task.result = output;
                            info!(task_id = %task.id, seq = %seq, "Task succeeded");
                        })
                }
                Err(e) if !e.is_retryable() => {
                    task.last_error = Some(e.to_string());
                    task.transition(TaskState::Failed).map(|_| {
                        task.error = Some(TaskError::new(FailureReason::BackendError, e.to_string()));
                        warn!(task_id = %task.id, error = %e, "Task failed");
                    })
                }
                Err(e) if flight.attempt >= retry.max_attempts => {
                    task.last_error = Some(e.to_string());
                    task.transition(TaskState::Failed).map(|_| {
                        task.error = Some(TaskError::new(
                            FailureReason::BackendExhausted,
                            format!("{} attempts failed, last error: {e}", flight.attempt),
                        ));
                        warn!(task_id = %task.id, attempts = flight.attempt, "Retries exhausted");
                    })
                }
                Err(e) => {
                    task.last_error = Some(e.to_string());
                    let step = if task.state == TaskState::Running {
                        task.transition(TaskState::Scheduled)
                    } else {
                        Ok(())
                    };
                    step.map(|_| {
                        task.assigned_backend = None;
                        let delay = retry_delay(&retry, flight.attempt);
                        info!(
                            task_id = %task.id,
                            attempt = flight.attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying task"
                        );
                        requeue = Some(QueuedTask::retry(
                            task,
                            flight.attempt + 1,
                            Instant::now() + delay,
                        ));
                    })
                }
            };
            if let Err(e) = applied {
                error!(task_id = %flight.task_id, error = %e, "Lifecycle violation");
            }
        }

        if let Some(entry) = requeue {
            self.scheduler.enqueue(entry).await;
        }
        self.scheduler.notify();
    }

    /// Route a backend-reported outcome to the waiting worker or probe.
    ///
    /// Repeating an outcome that was already delivered is accepted and
    /// ignored.
    pub async fn report_outcome(&self, req: &ReportOutcomeRequest) -> Result<(), DispatchError> {
        let seq = req.assignment_id;
        if let Some(tx) = self.probes.lock().await.remove(&seq) {
            let _ = tx.send(Completion::from(req));
            return Ok(());
        }

        let mut in_flight = self.in_flight.lock().await;
        let flight = in_flight
            .get_mut(&seq)
            .ok_or(DispatchError::UnknownAssignment(seq))?;
        if flight.task_id != req.task_id {
            return Err(DispatchError::TaskMismatch {
                seq,
                expected: flight.task_id.clone(),
                got: req.task_id.clone(),
            });
        }
        match flight.completion.take() {
            Some(tx) => {
                debug!(seq = %seq, task_id = %req.task_id, status = ?req.status, "Outcome reported");
                let _ = tx.send(Completion::from(req));
            }
            None => debug!(seq = %seq, "Repeated outcome ignored"),
        }
        Ok(())
    }

    /// Cancel a task. Returns false if it is unknown or already terminal.
    ///
    /// A queued task is simply dropped. For a dispatched task the
    /// cancellation is recorded and its slot freed immediately; the backend
    /// is asked to stop but may not honour it.
    pub async fn cancel(&self, task_id: &TaskId) -> bool {
        let seq = {
            let mut tasks = self.tasks.write().await;
            let Some(record) = tasks.get_mut(task_id) else {
                return false;
            };
            if record.task.is_terminal() {
                return false;
            }
            let previous = record.task.state;
            if let Err(e) = record.task.transition(TaskState::Cancelled) {
                error!(task_id = %task_id, error = %e, "Lifecycle violation");
                return false;
            }
            record.task.cancel_requested = record.current_seq.is_some();
            info!(task_id = %task_id, from = %previous, "Task cancelled");
            record.current_seq.take()
        };

        self.scheduler.remove(task_id).await;

        let Some(seq) = seq else {
            return true;
        };
        let flight = self.in_flight.lock().await.remove(&seq);
        self.registry.release(seq).await;
        if let Some(flight) = flight {
            flight.cancel.cancel();
            if let Some(executor) = self.registry.executor(&flight.backend_id).await {
                let task_id = task_id.clone();
                tokio::spawn(async move {
                    let honoured = executor.cancel(&task_id, seq).await;
                    debug!(task_id = %task_id, seq = %seq, honoured, "Backend cancel requested");
                });
            }
        }
        self.scheduler.notify();
        true
    }

    /// Fail over every assignment held by `backend_id` as a retryable error.
    /// Returns the number of assignments affected.
    pub async fn fail_backend(&self, backend_id: &BackendId, reason: &str) -> usize {
        let mut in_flight = self.in_flight.lock().await;
        let mut affected = 0;
        for (seq, flight) in in_flight.iter_mut() {
            if &flight.backend_id != backend_id {
                continue;
            }
            if let Some(tx) = flight.completion.take() {
                let _ = tx.send(Completion::Failed {
                    error: reason.to_string(),
                    retryable: true,
                });
                affected += 1;
                debug!(seq = %seq, backend_id = %backend_id, "Assignment failed over");
            }
        }
        affected
    }

    /// Fail a task the scheduler could not place on any backend.
    pub async fn mark_unschedulable(&self, task_id: &TaskId) {
        let mut tasks = self.tasks.write().await;
        let Some(record) = tasks.get_mut(task_id) else {
            return;
        };
        if record.task.is_terminal() {
            return;
        }
        match record.task.transition(TaskState::Failed) {
            Ok(()) => {
                record.task.error = Some(TaskError::new(
                    FailureReason::NoEligibleBackend,
                    "no registered backend matches the required capability tags",
                ));
                warn!(task_id = %task_id, "Task failed: no eligible backend");
            }
            Err(e) => error!(task_id = %task_id, error = %e, "Lifecycle violation"),
        }
    }

    /// Send a probe to a backend and wait for its reported outcome.
    pub async fn probe(&self, backend_id: &BackendId, timeout: Duration) -> bool {
        let Some(executor) = self.registry.executor(backend_id).await else {
            return false;
        };
        let seq = self.seq.next();
        let request = DispatchRequest::probe(seq);
        let probe_task = request.task_id.clone();
        let (tx, rx) = oneshot::channel();
        self.probes.lock().await.insert(seq, tx);

        let result = tokio::time::timeout(timeout, async {
            executor.execute(request).await?;
            rx.await
                .map_err(|_| DispatchError::Unavailable("probe withdrawn".to_string()))
        })
        .await;
        self.probes.lock().await.remove(&seq);
        if result.is_err() {
            let withdrawn = executor.cancel(&probe_task, seq).await;
            debug!(backend_id = %backend_id, seq = %seq, withdrawn, "Unanswered probe withdrawn");
        }

        let passed = matches!(result, Ok(Ok(Completion::Succeeded(_))));
        debug!(backend_id = %backend_id, seq = %seq, passed, "Probe finished");
        passed
    }

    /// Read-only view of a task.
    pub async fn status(&self, task_id: &TaskId) -> Result<TaskSnapshot, CoreError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|r| r.task.snapshot())
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))
    }

    /// Most recent underlying dispatch error of a task.
    pub async fn last_error(&self, task_id: &TaskId) -> Option<String> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .and_then(|r| r.task.last_error.clone())
    }

    /// All tasks, oldest submission first.
    pub async fn list(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self
            .tasks
            .read()
            .await
            .values()
            .map(|r| r.task.snapshot())
            .collect();
        all.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        all
    }

    /// Which reservations still belong to live work.
    pub async fn live_assignments(&self) -> LiveAssignments {
        let seqs = self.in_flight.lock().await.keys().copied().collect();
        let awaiting = self
            .tasks
            .read()
            .await
            .iter()
            .filter(|(_, r)| !r.task.is_terminal() && r.current_seq.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        LiveAssignments { seqs, awaiting }
    }

    /// Number of assignments currently held by workers.
    pub async fn in_flight_len(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Waits for room in the channel; signals are never dropped while the
    /// health relay is running.
    async fn emit(&self, signal: HealthSignal) {
        if self.signals.send(signal).await.is_err() {
            debug!("Health relay stopped, signal discarded");
        }
    }
}
