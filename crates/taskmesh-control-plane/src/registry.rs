//! Backend registry - tracks backends, their capacity, and liveness.
//!
//! The registry is the only writer of a backend's load and health. Slots
//! are taken through [`BackendRegistry::reserve`], which checks capacity and
//! records the reservation under one write lock, so two assignments can never
//! race onto the same final slot. The reservation is keyed by the assignment
//! sequence number, which makes `release` idempotent.
//!
//! A multi-instance deployment would replace the in-memory reservation map
//! with a shared counter store; everything else reads through this type.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use taskmesh_core::{AssignmentSeq, Backend, BackendHealth, BackendId, BackendInfo, TaskId};

use crate::config::ConfigHandle;
use crate::dispatch::BackendExecutor;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Backend not found: {0}")]
    NotFound(BackendId),

    #[error("Invalid backend registration: {0}")]
    InvalidRegistration(String),

    #[error("Backend {0} is quarantined")]
    Unavailable(BackendId),

    #[error("Backend {0} is at capacity")]
    AtCapacity(BackendId),

    #[error("Reservation {0} already exists")]
    DuplicateReservation(AssignmentSeq),

    #[error("Accounting invariant violated: {0}")]
    InvariantViolation(String),
}

/// A held backend slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub seq: AssignmentSeq,
    pub backend_id: BackendId,
    pub task_id: TaskId,
    pub estimated_duration_ms: u64,
}

/// Serializable registry state used for fail-fast recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub backends: Vec<Backend>,
    pub reservations: Vec<Reservation>,
}

struct BackendEntry {
    backend: Backend,
    /// Monotonic time of the last heartbeat.
    last_seen: Instant,
    /// Degraded because heartbeats stopped (rather than by explicit marking).
    stale: bool,
    quarantined_at: Option<Instant>,
    probe_streak: u32,
    executor: Arc<dyn BackendExecutor>,
}

#[derive(Default)]
struct RegistryInner {
    backends: HashMap<BackendId, BackendEntry>,
    reservations: HashMap<AssignmentSeq, Reservation>,
}

/// Tracks available execution backends.
pub struct BackendRegistry {
    inner: RwLock<RegistryInner>,
    config: ConfigHandle,
}

/// Validate that a backend id is usable as a path segment and log field.
pub fn validate_backend_id(id: &BackendId) -> Result<(), RegistryError> {
    let s = id.as_str();
    if s.is_empty() {
        return Err(RegistryError::InvalidRegistration(
            "backend id cannot be empty".to_string(),
        ));
    }
    if !s
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(RegistryError::InvalidRegistration(
            "backend id must contain only alphanumeric characters, '-', '_' and '.'".to_string(),
        ));
    }
    Ok(())
}

impl BackendRegistry {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            config,
        }
    }

    /// Register a backend, or refresh the registration of a known one.
    pub async fn register(
        &self,
        info: BackendInfo,
        executor: Arc<dyn BackendExecutor>,
    ) -> Result<(), RegistryError> {
        validate_backend_id(&info.id)?;
        if info.capacity == 0 {
            return Err(RegistryError::InvalidRegistration(
                "capacity must be at least 1".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;
        let id = info.id.clone();
        let now = Instant::now();

        match inner.backends.get_mut(&id) {
            Some(entry) => {
                if info.capacity < entry.backend.current_load {
                    return Err(RegistryError::InvalidRegistration(format!(
                        "capacity {} is below current load {}",
                        info.capacity, entry.backend.current_load
                    )));
                }
                entry.backend.info = info;
                entry.backend.last_heartbeat = Utc::now();
                entry.last_seen = now;
                entry.executor = executor;
                info!(backend_id = %id, "Backend re-registered");
            }
            None => {
                info!(
                    backend_id = %id,
                    capacity = info.capacity,
                    tags = ?info.capability_tags,
                    "Backend registered"
                );
                inner.backends.insert(
                    id,
                    BackendEntry {
                        backend: Backend::new(info),
                        last_seen: now,
                        stale: false,
                        quarantined_at: None,
                        probe_streak: 0,
                        executor,
                    },
                );
            }
        }
        Ok(())
    }

    /// Remove a backend. Returns the reservations it still held.
    pub async fn deregister(&self, id: &BackendId) -> Result<Vec<Reservation>, RegistryError> {
        let mut inner = self.inner.write().await;
        inner
            .backends
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        let orphaned: Vec<AssignmentSeq> = inner
            .reservations
            .values()
            .filter(|r| &r.backend_id == id)
            .map(|r| r.seq)
            .collect();
        let orphaned: Vec<Reservation> = orphaned
            .into_iter()
            .filter_map(|seq| inner.reservations.remove(&seq))
            .collect();

        info!(backend_id = %id, orphaned = orphaned.len(), "Backend deregistered");
        Ok(orphaned)
    }

    /// Record a heartbeat. A backend degraded only by heartbeat silence
    /// returns to Healthy.
    pub async fn heartbeat(
        &self,
        id: &BackendId,
        load_sample: u32,
    ) -> Result<BackendHealth, RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .backends
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        entry.last_seen = Instant::now();
        entry.backend.last_heartbeat = Utc::now();
        entry.backend.reported_load = load_sample;

        if load_sample != entry.backend.current_load {
            debug!(
                backend_id = %id,
                reported = load_sample,
                reserved = entry.backend.current_load,
                "Heartbeat load differs from reservations"
            );
        }

        if entry.stale && entry.backend.health == BackendHealth::Degraded {
            entry.stale = false;
            entry.backend.health = BackendHealth::Healthy;
            info!(backend_id = %id, "Heartbeat resumed, backend healthy");
        }

        Ok(entry.backend.health)
    }

    /// Degrade healthy backends whose heartbeat is older than `timeout`.
    pub async fn mark_stale(&self, timeout: Duration) -> Vec<BackendId> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let mut degraded = Vec::new();

        for (id, entry) in inner.backends.iter_mut() {
            if entry.backend.health == BackendHealth::Healthy
                && now.duration_since(entry.last_seen) > timeout
            {
                entry.backend.health = BackendHealth::Degraded;
                entry.stale = true;
                warn!(backend_id = %id, "Heartbeat missed, backend degraded");
                degraded.push(id.clone());
            }
        }
        degraded
    }

    /// Backends able to run a task with `tags`, best candidates first.
    ///
    /// Ordered by ascending load, then descending recent success rate.
    /// Quarantined backends are never returned.
    pub async fn list_eligible(&self, tags: &BTreeSet<String>) -> Vec<Backend> {
        let inner = self.inner.read().await;
        let mut eligible: Vec<Backend> = inner
            .backends
            .values()
            .filter(|e| e.backend.health.can_accept_tasks() && e.backend.info.supports(tags))
            .map(|e| e.backend.clone())
            .collect();

        eligible.sort_by(|a, b| {
            a.utilization()
                .total_cmp(&b.utilization())
                .then_with(|| b.success_rate.total_cmp(&a.success_rate))
                .then_with(|| a.id().cmp(b.id()))
        });
        eligible
    }

    /// Set a backend's health. Returns the previous health.
    ///
    /// Restoring a quarantined backend to Healthy resets its load to zero and
    /// drops any reservations still pointing at it.
    pub async fn mark_health(
        &self,
        id: &BackendId,
        status: BackendHealth,
    ) -> Result<BackendHealth, RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .backends
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        let previous = entry.backend.health;
        entry.backend.health = status;
        entry.stale = false;

        match status {
            BackendHealth::Quarantined => {
                if previous != BackendHealth::Quarantined {
                    entry.quarantined_at = Some(Instant::now());
                    entry.probe_streak = 0;
                }
            }
            BackendHealth::Healthy if previous == BackendHealth::Quarantined => {
                entry.quarantined_at = None;
                entry.probe_streak = 0;
                entry.last_seen = Instant::now();
                entry.backend.current_load = 0;
                entry.backend.reserved_work_ms = 0;
                entry.backend.consecutive_failures = 0;
                entry.backend.success_rate = 1.0;

                let before = inner.reservations.len();
                inner.reservations.retain(|_, r| &r.backend_id != id);
                let dropped = before - inner.reservations.len();
                if dropped > 0 {
                    warn!(backend_id = %id, dropped, "Dropped stale reservations on restore");
                }
            }
            _ => {}
        }

        if previous != status {
            info!(backend_id = %id, from = %previous, to = %status, "Backend health changed");
        }
        Ok(previous)
    }

    /// Atomically take one slot on `backend_id` for assignment `seq`.
    pub async fn reserve(
        &self,
        backend_id: &BackendId,
        seq: AssignmentSeq,
        task_id: &TaskId,
        estimated_duration_ms: u64,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        if inner.reservations.contains_key(&seq) {
            return Err(RegistryError::DuplicateReservation(seq));
        }

        let entry = inner
            .backends
            .get_mut(backend_id)
            .ok_or_else(|| RegistryError::NotFound(backend_id.clone()))?;

        if !entry.backend.health.can_accept_tasks() {
            return Err(RegistryError::Unavailable(backend_id.clone()));
        }
        if !entry.backend.has_spare_capacity() {
            return Err(RegistryError::AtCapacity(backend_id.clone()));
        }

        entry.backend.current_load += 1;
        entry.backend.reserved_work_ms += estimated_duration_ms;

        inner.reservations.insert(
            seq,
            Reservation {
                seq,
                backend_id: backend_id.clone(),
                task_id: task_id.clone(),
                estimated_duration_ms,
            },
        );
        Ok(())
    }

    /// Give back the slot held by `seq`. Releasing twice is a no-op.
    pub async fn release(&self, seq: AssignmentSeq) -> Option<Reservation> {
        let mut inner = self.inner.write().await;
        let reservation = inner.reservations.remove(&seq)?;

        if let Some(entry) = inner.backends.get_mut(&reservation.backend_id) {
            if entry.backend.current_load == 0 {
                error!(
                    backend_id = %reservation.backend_id,
                    seq = %seq,
                    "Released reservation on a backend with zero load"
                );
            }
            entry.backend.current_load = entry.backend.current_load.saturating_sub(1);
            entry.backend.reserved_work_ms = entry
                .backend
                .reserved_work_ms
                .saturating_sub(reservation.estimated_duration_ms);
        }
        Some(reservation)
    }

    /// Whether `seq` still holds a slot.
    pub async fn is_reserved(&self, seq: AssignmentSeq) -> bool {
        self.inner.read().await.reservations.contains_key(&seq)
    }

    /// Reservations currently held on a backend.
    pub async fn reservations_for(&self, backend_id: &BackendId) -> Vec<Reservation> {
        self.inner
            .read()
            .await
            .reservations
            .values()
            .filter(|r| &r.backend_id == backend_id)
            .cloned()
            .collect()
    }

    /// Fold a dispatch outcome into the backend's success statistics.
    /// Returns the updated consecutive failure count.
    pub async fn record_outcome(&self, id: &BackendId, success: bool) -> Option<u32> {
        let alpha = self.config.current().registry.success_rate_alpha;
        let mut inner = self.inner.write().await;
        let backend = &mut inner.backends.get_mut(id)?.backend;

        if success {
            backend.consecutive_failures = 0;
            backend.success_rate = backend.success_rate * (1.0 - alpha) + alpha;
        } else {
            backend.consecutive_failures += 1;
            backend.success_rate *= 1.0 - alpha;
        }
        Some(backend.consecutive_failures)
    }

    /// Quarantined backends whose cooldown has elapsed.
    pub async fn probe_candidates(&self, cooldown: Duration) -> Vec<BackendId> {
        let inner = self.inner.read().await;
        let now = Instant::now();
        let mut ids: Vec<BackendId> = inner
            .backends
            .iter()
            .filter(|(_, e)| {
                e.backend.health == BackendHealth::Quarantined
                    && e.quarantined_at
                        .map(|at| now.duration_since(at) >= cooldown)
                        .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Record a probe result. Returns the consecutive success streak.
    ///
    /// A failed probe resets the streak and restarts the cooldown.
    pub async fn record_probe(&self, id: &BackendId, success: bool) -> Result<u32, RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .backends
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        if success {
            entry.probe_streak += 1;
        } else {
            entry.probe_streak = 0;
            entry.quarantined_at = Some(Instant::now());
        }
        Ok(entry.probe_streak)
    }

    pub async fn get(&self, id: &BackendId) -> Option<Backend> {
        self.inner
            .read()
            .await
            .backends
            .get(id)
            .map(|e| e.backend.clone())
    }

    /// All backends, sorted by id.
    pub async fn list(&self) -> Vec<Backend> {
        let inner = self.inner.read().await;
        let mut all: Vec<Backend> = inner.backends.values().map(|e| e.backend.clone()).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Executor handle for a backend.
    pub async fn executor(&self, id: &BackendId) -> Option<Arc<dyn BackendExecutor>> {
        self.inner
            .read()
            .await
            .backends
            .get(id)
            .map(|e| e.executor.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.backends.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read().await;
        let mut backends: Vec<Backend> =
            inner.backends.values().map(|e| e.backend.clone()).collect();
        backends.sort_by(|a, b| a.id().cmp(b.id()));
        let mut reservations: Vec<Reservation> = inner.reservations.values().cloned().collect();
        reservations.sort_by_key(|r| r.seq);
        RegistrySnapshot {
            backends,
            reservations,
        }
    }

    /// Verify load accounting against the reservation ledger.
    pub async fn audit(&self) -> Result<(), RegistryError> {
        let inner = self.inner.read().await;
        let mut held: HashMap<&BackendId, (u32, u64)> = HashMap::new();

        for r in inner.reservations.values() {
            if !inner.backends.contains_key(&r.backend_id) {
                return Err(RegistryError::InvariantViolation(format!(
                    "reservation {} points at unknown backend {}",
                    r.seq, r.backend_id
                )));
            }
            let slot = held.entry(&r.backend_id).or_default();
            slot.0 += 1;
            slot.1 += r.estimated_duration_ms;
        }

        for (id, entry) in &inner.backends {
            let b = &entry.backend;
            let (count, work) = held.get(id).copied().unwrap_or_default();
            if b.current_load > b.capacity() {
                return Err(RegistryError::InvariantViolation(format!(
                    "backend {id} load {} exceeds capacity {}",
                    b.current_load,
                    b.capacity()
                )));
            }
            if b.current_load != count || b.reserved_work_ms != work {
                return Err(RegistryError::InvariantViolation(format!(
                    "backend {id} load {} does not match {count} reservations",
                    b.current_load
                )));
            }
        }
        Ok(())
    }

    /// Repair accounting after a failed audit.
    ///
    /// Health and outcome statistics come from `snapshot`. The reservation
    /// ledger is the live one, cut down to reservations `live` still vouches
    /// for, and every backend's load is recounted from it. Executors and
    /// registration info are never part of the snapshot.
    pub async fn restore<F>(&self, snapshot: &RegistrySnapshot, live: F)
    where
        F: Fn(&Reservation) -> bool,
    {
        let mut inner = self.inner.write().await;
        let RegistryInner {
            backends,
            reservations,
        } = &mut *inner;
        let now = Instant::now();

        for saved in &snapshot.backends {
            if let Some(entry) = backends.get_mut(saved.id()) {
                let b = &mut entry.backend;
                b.health = saved.health;
                b.success_rate = saved.success_rate;
                b.consecutive_failures = saved.consecutive_failures;
                b.reported_load = saved.reported_load;
                entry.last_seen = now;
                if saved.health == BackendHealth::Quarantined {
                    entry.quarantined_at.get_or_insert(now);
                } else {
                    entry.quarantined_at = None;
                    entry.probe_streak = 0;
                }
            }
        }

        let before = reservations.len();
        reservations.retain(|_, r| backends.contains_key(&r.backend_id) && live(r));

        for entry in backends.values_mut() {
            entry.backend.current_load = 0;
            entry.backend.reserved_work_ms = 0;
        }
        for r in reservations.values() {
            if let Some(entry) = backends.get_mut(&r.backend_id) {
                entry.backend.current_load += 1;
                entry.backend.reserved_work_ms += r.estimated_duration_ms;
            }
        }

        warn!(
            backends = snapshot.backends.len(),
            reservations = reservations.len(),
            dropped = before - reservations.len(),
            "Registry accounting rebuilt"
        );
    }

    #[cfg(test)]
    pub(crate) async fn force_load(&self, id: &BackendId, load: u32) {
        if let Some(entry) = self.inner.write().await.backends.get_mut(id) {
            entry.backend.current_load = load;
        }
    }
}
