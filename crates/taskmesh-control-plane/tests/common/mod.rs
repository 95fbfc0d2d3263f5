//! Shared fixtures for the end-to-end scheduling tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};

use taskmesh_control_plane::config::Config;
use taskmesh_control_plane::dispatch::{DispatchError, DispatchRequest};
use taskmesh_control_plane::{AppState, BackendExecutor, ConfigHandle, LifecycleTracker};
use taskmesh_core::api::{OutcomeStatus, ReportOutcomeRequest, SubmitRequest};
use taskmesh_core::{AssignmentSeq, BackendInfo, CallerId, Priority, TaskId, TaskState};

/// What a simulated backend does with one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail,
    /// Accept and never report.
    Hang,
}

/// In-process backend that reports its own outcomes after `work`.
///
/// Behaviours are consumed one per task request; the last one repeats.
/// Probes always follow `probe_behavior`.
pub struct SimBackend {
    script: Mutex<VecDeque<Behavior>>,
    probe_behavior: Mutex<Behavior>,
    work: Duration,
    tracker: OnceLock<Weak<LifecycleTracker>>,
    seen: Mutex<Vec<DispatchRequest>>,
    probes: AtomicU32,
    running: Arc<AtomicU32>,
    peak: AtomicU32,
}

impl SimBackend {
    pub fn new(script: impl IntoIterator<Item = Behavior>, work: Duration) -> Arc<Self> {
        let script: VecDeque<Behavior> = script.into_iter().collect();
        assert!(!script.is_empty());
        Arc::new(Self {
            script: Mutex::new(script),
            probe_behavior: Mutex::new(Behavior::Succeed),
            work,
            tracker: OnceLock::new(),
            seen: Mutex::new(Vec::new()),
            probes: AtomicU32::new(0),
            running: Arc::new(AtomicU32::new(0)),
            peak: AtomicU32::new(0),
        })
    }

    pub fn succeeding(work: Duration) -> Arc<Self> {
        Self::new([Behavior::Succeed], work)
    }

    pub fn set_probe_behavior(&self, behavior: Behavior) {
        *self.probe_behavior.lock().unwrap() = behavior;
    }

    /// Task requests seen so far (probes excluded).
    pub fn executions(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn seen(&self) -> Vec<DispatchRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Highest number of tasks this backend held at once.
    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> Behavior {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script[0]
        }
    }

    fn report(&self, seq: AssignmentSeq, task_id: TaskId, behavior: Behavior, probe: bool) {
        if behavior == Behavior::Hang {
            return;
        }
        let Some(tracker) = self.tracker.get().and_then(Weak::upgrade) else {
            return;
        };
        let work = self.work;
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            tokio::time::sleep(work).await;
            if !probe {
                running.fetch_sub(1, Ordering::SeqCst);
            }
            let (status, result, error) = match behavior {
                Behavior::Succeed => (OutcomeStatus::Succeeded, Some(format!("ok:{task_id}")), None),
                _ => (OutcomeStatus::Failed, None, Some("simulated failure".to_string())),
            };
            let _ = tracker
                .report_outcome(&ReportOutcomeRequest {
                    assignment_id: seq,
                    task_id,
                    status,
                    result,
                    error,
                    retryable: true,
                })
                .await;
        });
    }
}

#[async_trait]
impl BackendExecutor for SimBackend {
    async fn execute(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        if request.probe {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let behavior = *self.probe_behavior.lock().unwrap();
            self.report(request.seq, request.task_id.clone(), behavior, true);
            return Ok(());
        }

        let behavior = self.next_behavior();
        self.seen.lock().unwrap().push(request.clone());
        if behavior != Behavior::Hang {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }
        self.report(request.seq, request.task_id, behavior, false);
        Ok(())
    }

    async fn cancel(&self, _task_id: &TaskId, _seq: AssignmentSeq) -> bool {
        false
    }
}

/// Config tuned for millisecond-scale tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.scheduler.tick_interval_ms = 10;
    config.scheduler.max_unschedulable_ticks = 1_000;
    config.dispatch.min_timeout_ms = 100;
    config.dispatch.retry.base_backoff_ms = 10;
    config.dispatch.retry.max_backoff_ms = 50;
    config.resilience.health_check_interval_ms = 10;
    config.resilience.probe_cooldown_ms = 50;
    config.resilience.probe_interval_ms = 20;
    config.resilience.probe_timeout_ms = 100;
    config
}

pub fn new_state(config: Config) -> Arc<AppState> {
    AppState::new(ConfigHandle::new(config))
}

pub async fn add_backend(state: &Arc<AppState>, id: &str, tags: &[&str], capacity: u32, sim: &Arc<SimBackend>) {
    let _ = sim.tracker.set(Arc::downgrade(&state.tracker));
    state
        .register_with_executor(
            BackendInfo::new(id, tags.iter().copied(), capacity),
            Arc::clone(sim) as Arc<dyn BackendExecutor>,
        )
        .await
        .unwrap();
}

pub fn request(caller: &str, tags: &[&str], priority: Priority) -> SubmitRequest {
    SubmitRequest {
        task_id: None,
        caller_id: CallerId::new(caller),
        capability_tags: tags.iter().map(|t| t.to_string()).collect(),
        priority,
        estimated_duration_ms: 10,
        payload: STANDARD.encode(b"work"),
    }
}

/// Poll `check` every 10ms until it holds, panicking after `limit`.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Run scheduling ticks until `check` holds.
pub async fn drive<F, Fut>(state: &Arc<AppState>, limit: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        state.run_tick().await;
        if check().await {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn state_of(state: &Arc<AppState>, id: &TaskId) -> TaskState {
    state.tracker.status(id).await.unwrap().state
}

/// Run ticks until every task is terminal; returns their final states.
pub async fn drive_to_terminal(state: &Arc<AppState>, ids: &[TaskId], limit: Duration) -> Vec<TaskState> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        state.run_tick().await;
        let mut states = Vec::with_capacity(ids.len());
        for id in ids {
            states.push(state_of(state, id).await);
        }
        if states.iter().all(|s| s.is_terminal()) {
            return states;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tasks still open after {limit:?}: {states:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
