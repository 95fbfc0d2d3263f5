//! Execution backend types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::{BackendHealth, BackendId};

/// Static description of a backend supplied at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Unique backend identifier.
    pub id: BackendId,

    /// Capability tags this backend provides.
    pub capability_tags: BTreeSet<String>,

    /// Maximum concurrent tasks.
    pub capacity: u32,

    /// Free-form labels (region, hardware, adapter kind, etc.).
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl BackendInfo {
    /// Create a new BackendInfo.
    pub fn new<I, S>(id: impl Into<BackendId>, tags: I, capacity: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capability_tags: tags.into_iter().map(Into::into).collect(),
            capacity,
            labels: HashMap::new(),
        }
    }

    /// Builder method to add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Check if this backend carries every required tag.
    pub fn supports(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capability_tags)
    }
}

/// Live view of a backend as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub info: BackendInfo,

    /// Number of reserved slots.
    pub current_load: u32,

    /// Current health.
    pub health: BackendHealth,

    /// Timestamp of the last heartbeat.
    pub last_heartbeat: DateTime<Utc>,

    /// Load last reported by the backend itself.
    pub reported_load: u32,

    /// Exponentially weighted success rate in `[0, 1]`.
    pub success_rate: f64,

    /// Dispatch failures since the last success.
    pub consecutive_failures: u32,

    /// Sum of estimated durations of the tasks holding slots.
    pub reserved_work_ms: u64,
}

impl Backend {
    /// Create a fresh, healthy backend with no load.
    pub fn new(info: BackendInfo) -> Self {
        Self {
            info,
            current_load: 0,
            health: BackendHealth::Healthy,
            last_heartbeat: Utc::now(),
            reported_load: 0,
            success_rate: 1.0,
            consecutive_failures: 0,
            reserved_work_ms: 0,
        }
    }

    pub fn id(&self) -> &BackendId {
        &self.info.id
    }

    pub fn capacity(&self) -> u32 {
        self.info.capacity
    }

    /// Returns true if another task fits.
    pub fn has_spare_capacity(&self) -> bool {
        self.current_load < self.info.capacity
    }

    /// Load as a fraction of capacity.
    pub fn utilization(&self) -> f64 {
        if self.info.capacity == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.info.capacity)
    }

    /// Average outstanding work per slot, in milliseconds.
    pub fn estimated_queue_delay_ms(&self) -> f64 {
        if self.info.capacity == 0 {
            return 0.0;
        }
        self.reserved_work_ms as f64 / f64::from(self.info.capacity)
    }
}
