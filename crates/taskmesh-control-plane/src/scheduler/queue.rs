//! Priority queue with starvation promotion.
//!
//! One ordered lane per priority class. Within a lane, entries are keyed by
//! submission time and then arrival order, so earlier submissions always win
//! ties. A task that sits in a lane longer than the starvation threshold is
//! moved up one lane, which puts it ahead of every newer task of its
//! original class or lower.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use taskmesh_core::{Priority, Task, TaskId};

/// A task waiting for a backend slot.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub capability_tags: BTreeSet<String>,
    /// Declared priority class.
    pub priority: Priority,
    pub estimated_duration_ms: u64,
    pub submitted_at: DateTime<Utc>,
    /// Attempt number the next assignment will carry.
    pub attempt: u32,
    /// Retry backoff: not schedulable before this instant.
    pub not_before: Option<Instant>,
    /// Ticks on which no eligible backend existed.
    pub misses: u32,
    lane: Priority,
    lane_since: Instant,
}

impl QueuedTask {
    /// First-attempt entry for a freshly admitted task.
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            capability_tags: task.spec.capability_tags.clone(),
            priority: task.spec.priority,
            estimated_duration_ms: task.spec.estimated_duration_ms,
            submitted_at: task.submitted_at,
            attempt: 1,
            not_before: None,
            misses: 0,
            lane: task.spec.priority,
            lane_since: Instant::now(),
        }
    }

    /// Entry for a retry that must wait until `not_before`.
    pub fn retry(task: &Task, attempt: u32, not_before: Instant) -> Self {
        Self {
            attempt,
            not_before: Some(not_before),
            ..Self::from_task(task)
        }
    }

    /// Lane the task currently sits in (its class after promotions).
    pub fn lane(&self) -> Priority {
        self.lane
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map(|t| t <= now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    submitted_at: DateTime<Utc>,
    order: u64,
}

/// Serializable view of one queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntrySnapshot {
    pub task_id: TaskId,
    pub priority: Priority,
    pub lane: Priority,
    pub submitted_at: DateTime<Utc>,
    pub attempt: u32,
    pub misses: u32,
}

/// Lanes of queued tasks, highest class first on iteration.
#[derive(Debug, Default)]
pub struct TaskQueue {
    lanes: [BTreeMap<QueueKey, QueuedTask>; 3],
    index: HashMap<TaskId, (Priority, QueueKey)>,
    next_order: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Returns false if the id is already queued.
    pub fn push(&mut self, task: QueuedTask) -> bool {
        if self.index.contains_key(&task.task_id) {
            return false;
        }
        let key = QueueKey {
            submitted_at: task.submitted_at,
            order: self.next_order,
        };
        self.next_order += 1;
        self.index.insert(task.task_id.clone(), (task.lane, key));
        self.lanes[task.lane.index()].insert(key, task);
        true
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<QueuedTask> {
        let (lane, key) = self.index.remove(id)?;
        self.lanes[lane.index()].remove(&key)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut QueuedTask> {
        let (lane, key) = self.index.get(id)?;
        self.lanes[lane.index()].get_mut(key)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Move every task that waited at least `threshold` in its lane up one
    /// class. A zero threshold disables promotion.
    pub fn promote_starved(&mut self, now: Instant, threshold: Duration) -> Vec<TaskId> {
        if threshold.is_zero() {
            return Vec::new();
        }
        let mut promoted = Vec::new();

        for class in [Priority::Normal, Priority::Low] {
            let starved: Vec<QueueKey> = self.lanes[class.index()]
                .iter()
                .filter(|(_, t)| now.duration_since(t.lane_since) >= threshold)
                .map(|(k, _)| *k)
                .collect();

            let target = class.promoted();
            for key in starved {
                if let Some(mut task) = self.lanes[class.index()].remove(&key) {
                    task.lane = target;
                    task.lane_since = now;
                    self.index.insert(task.task_id.clone(), (target, key));
                    promoted.push(task.task_id.clone());
                    self.lanes[target.index()].insert(key, task);
                }
            }
        }
        promoted
    }

    /// Every entry in scheduling order.
    pub fn ordered(&self) -> Vec<QueuedTask> {
        Priority::DESCENDING
            .iter()
            .flat_map(|p| self.lanes[p.index()].values().cloned())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<QueueEntrySnapshot> {
        self.ordered()
            .into_iter()
            .map(|t| QueueEntrySnapshot {
                task_id: t.task_id.clone(),
                priority: t.priority,
                lane: t.lane,
                submitted_at: t.submitted_at,
                attempt: t.attempt,
                misses: t.misses,
            })
            .collect()
    }
}
