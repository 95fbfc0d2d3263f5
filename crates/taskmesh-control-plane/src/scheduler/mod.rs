//! Scheduler core - assigns queued tasks to backend slots.
//!
//! Each tick walks the queue in priority order and, for every ready task,
//! picks the eligible backend with the lowest placement cost. This is a
//! greedy best-fit heuristic: O(tasks x backends) per tick with no global
//! optimisation. Slots are taken through the registry's atomic reservation,
//! so the scheduler never mutates backend state itself.

mod queue;

pub use queue::{QueueEntrySnapshot, QueuedTask, TaskQueue};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskmesh_core::{Assignment, AssignmentSeq, Backend, TaskId};

use crate::config::{ConfigHandle, SchedulerConfig};
use crate::registry::BackendRegistry;

/// Source of monotonically increasing assignment sequence numbers.
#[derive(Clone, Default)]
pub struct SeqGenerator(Arc<AtomicU64>);

impl SeqGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> AssignmentSeq {
        AssignmentSeq::new(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Result of one scheduling pass.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// New assignments, each already holding its backend reservation.
    pub assignments: Vec<Assignment>,
    /// Tasks dropped from the queue because no backend could ever take them.
    pub unschedulable: Vec<TaskId>,
    /// Tasks moved up a priority class this tick.
    pub promoted: Vec<TaskId>,
}

impl TickOutcome {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.unschedulable.is_empty()
    }
}

/// Weighted placement cost; lower is better.
///
/// Combines utilisation, the inverse of the recent success rate, and the
/// estimated queueing delay in seconds.
pub fn placement_cost(backend: &Backend, weights: &SchedulerConfig) -> f64 {
    let load = backend.utilization();
    let unreliability = 1.0 - backend.success_rate.clamp(0.0, 1.0);
    let queue_delay_secs = backend.estimated_queue_delay_ms() / 1000.0;

    weights.load_weight * load
        + weights.failure_weight * unreliability
        + weights.queue_delay_weight * queue_delay_secs
}

/// Task scheduler.
pub struct Scheduler {
    registry: Arc<BackendRegistry>,
    queue: Mutex<TaskQueue>,
    tick_guard: Mutex<()>,
    seq: SeqGenerator,
    config: ConfigHandle,
    wake: Notify,
}

impl Scheduler {
    /// Create a new Scheduler.
    pub fn new(registry: Arc<BackendRegistry>, config: ConfigHandle, seq: SeqGenerator) -> Self {
        Self {
            registry,
            queue: Mutex::new(TaskQueue::new()),
            tick_guard: Mutex::new(()),
            seq,
            config,
            wake: Notify::new(),
        }
    }

    /// Queue a task for placement. Returns false if it is already queued.
    pub async fn enqueue(&self, task: QueuedTask) -> bool {
        let task_id = task.task_id.clone();
        let added = self.queue.lock().await.push(task);
        if added {
            debug!(task_id = %task_id, "Task enqueued");
            self.wake.notify_one();
        }
        added
    }

    /// Drop a queued task (e.g. on cancel). Returns true if it was queued.
    pub async fn remove(&self, task_id: &TaskId) -> bool {
        self.queue.lock().await.remove(task_id).is_some()
    }

    pub async fn contains(&self, task_id: &TaskId) -> bool {
        self.queue.lock().await.contains(task_id)
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn snapshot(&self) -> Vec<QueueEntrySnapshot> {
        self.queue.lock().await.snapshot()
    }

    /// Ask for an early tick (new work or freed capacity).
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Resolves when someone called [`Scheduler::notify`] or enqueued work.
    pub async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Run one scheduling pass.
    ///
    /// Single-flight: if another tick is running this returns an empty
    /// outcome immediately, coalescing with the tick in progress.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            debug!("Tick already in flight, coalescing");
            return TickOutcome::default();
        };

        let config = self.config.current();
        let weights = &config.scheduler;
        let now = Instant::now();

        let (candidates, promoted) = {
            let mut queue = self.queue.lock().await;
            let threshold = Duration::from_millis(weights.starvation_threshold_ms);
            let promoted = queue.promote_starved(now, threshold);
            (queue.ordered(), promoted)
        };
        for task_id in &promoted {
            info!(task_id = %task_id, "Starved task promoted");
        }

        let mut placed = Vec::new();
        let mut waiting = Vec::new();
        let mut missed = Vec::new();

        for entry in candidates.iter().filter(|t| t.is_ready(now)) {
            let eligible = self.registry.list_eligible(&entry.capability_tags).await;
            if eligible.is_empty() {
                missed.push(entry.task_id.clone());
                continue;
            }
            match self.place(entry, eligible, weights).await {
                Some(assignment) => placed.push(assignment),
                None => waiting.push(entry.task_id.clone()),
            }
        }

        let mut outcome = TickOutcome {
            promoted,
            ..TickOutcome::default()
        };
        let mut orphaned = Vec::new();
        {
            let mut queue = self.queue.lock().await;
            for assignment in placed {
                // Removed while we were placing it (cancelled): give the slot back.
                if queue.remove(&assignment.task_id).is_none() {
                    orphaned.push(assignment.seq);
                    continue;
                }
                outcome.assignments.push(assignment);
            }
            for task_id in waiting {
                if let Some(entry) = queue.get_mut(&task_id) {
                    entry.misses = 0;
                }
            }
            for task_id in missed {
                let Some(entry) = queue.get_mut(&task_id) else {
                    continue;
                };
                entry.misses += 1;
                if entry.misses >= weights.max_unschedulable_ticks {
                    queue.remove(&task_id);
                    warn!(task_id = %task_id, "No eligible backend, giving up");
                    outcome.unschedulable.push(task_id);
                }
            }
        }
        for seq in orphaned {
            self.registry.release(seq).await;
        }

        for a in &outcome.assignments {
            info!(
                task_id = %a.task_id,
                backend_id = %a.backend_id,
                seq = %a.seq,
                attempt = a.attempt,
                "Task assigned"
            );
        }
        outcome
    }

    /// Reserve the cheapest backend with spare capacity for `entry`.
    async fn place(
        &self,
        entry: &QueuedTask,
        eligible: Vec<Backend>,
        weights: &SchedulerConfig,
    ) -> Option<Assignment> {
        let mut candidates: Vec<(f64, Backend)> = eligible
            .into_iter()
            .filter(Backend::has_spare_capacity)
            .map(|b| (placement_cost(&b, weights), b))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Stable: equal costs keep the registry's load/success ordering.
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let seq = self.seq.next();
        for (_, backend) in candidates {
            match self
                .registry
                .reserve(backend.id(), seq, &entry.task_id, entry.estimated_duration_ms)
                .await
            {
                Ok(()) => {
                    return Some(Assignment::new(
                        seq,
                        entry.task_id.clone(),
                        backend.info.id,
                        entry.attempt,
                    ))
                }
                Err(e) => debug!(backend_id = %backend.id(), error = %e, "Reservation refused"),
            }
        }
        None
    }
}
