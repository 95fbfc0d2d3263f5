//! Control plane configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config file.
//! The live configuration is published through [`ConfigHandle`]; components
//! read the current snapshot per operation, which makes a reload atomic
//! without touching in-flight work.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use taskmesh_core::Policy;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("No config file to reload")]
    NoFile,
}

/// Control plane configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub admission: AdmissionConfig,
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
    pub resilience: ResilienceConfig,
    pub policy: Policy,
}

/// HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP server bind address.
    pub http_bind_addr: String,

    /// How often the config file is checked for changes.
    pub config_poll_interval_ms: u64,

    /// Longest a backend adapter may long-poll its mailbox.
    pub max_mailbox_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_bind_addr: "127.0.0.1:7070".to_string(),
            config_poll_interval_ms: 2_000,
            max_mailbox_wait_ms: 30_000,
        }
    }
}

/// Backend registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Heartbeat absence after which a backend is Degraded.
    pub heartbeat_timeout_ms: u64,

    /// Consecutive dispatch failures that quarantine a backend.
    pub quarantine_failure_threshold: u32,

    /// Smoothing factor for the recent success rate.
    pub success_rate_alpha: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 45_000,
            quarantine_failure_threshold: 3,
            success_rate_alpha: 0.2,
        }
    }
}

/// Structural limits applied before rate limiting and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub max_payload_bytes: usize,
    pub max_estimated_duration_ms: u64,
    pub max_capability_tags: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            max_estimated_duration_ms: 24 * 60 * 60 * 1000,
            max_capability_tags: 32,
        }
    }
}

/// Scheduler core settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fixed tick cadence.
    pub tick_interval_ms: u64,

    /// Waiting time after which a task is promoted one priority class.
    pub starvation_threshold_ms: u64,

    /// Ticks a task may find no eligible backend before failing.
    pub max_unschedulable_ticks: u32,

    /// Cost weight of load / capacity.
    pub load_weight: f64,

    /// Cost weight of the inverse recent success rate.
    pub failure_weight: f64,

    /// Cost weight per second of estimated queueing delay.
    pub queue_delay_weight: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            starvation_threshold_ms: 30_000,
            max_unschedulable_ticks: 20,
            load_weight: 1.0,
            failure_weight: 1.0,
            queue_delay_weight: 0.1,
        }
    }
}

/// Retry/backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total dispatch attempts, including the first.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Fraction of the backoff randomised in either direction.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 10_000,
            jitter_ratio: 0.2,
        }
    }
}

/// Dispatch & lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub retry: RetryPolicy,

    /// Deadline as a multiple of the estimated duration.
    pub timeout_multiplier: f64,

    /// Deadline floor.
    pub min_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout_multiplier: 3.0,
            min_timeout_ms: 1_000,
        }
    }
}

impl DispatchConfig {
    /// Completion deadline for a task with the given estimate.
    pub fn deadline_for(&self, estimated_duration_ms: u64) -> Duration {
        let scaled = (estimated_duration_ms as f64 * self.timeout_multiplier).ceil() as u64;
        Duration::from_millis(scaled.max(self.min_timeout_ms))
    }
}

/// Resilience subsystem settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Sliding window for per-caller behaviour.
    pub anomaly_window_ms: u64,

    /// Rejections inside the window that count as abuse.
    pub rejection_threshold: u32,

    /// Submissions inside the window that count as a flood.
    pub flood_threshold: u32,

    /// Multiplier applied to a caller's rate limit on each tightening.
    pub tighten_factor: f64,

    /// Tightenings after which the caller is denied outright.
    pub deny_after_tightenings: u32,

    pub deny_duration_ms: u64,

    /// Heartbeat sweep cadence.
    pub health_check_interval_ms: u64,

    /// Time a backend stays quarantined before probing starts.
    pub probe_cooldown_ms: u64,

    pub probe_interval_ms: u64,

    pub probe_timeout_ms: u64,

    /// Consecutive successful probes needed to restore a backend.
    pub probes_required: u32,

    /// Alerts kept for the HTTP surface.
    pub alert_history: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            anomaly_window_ms: 60_000,
            rejection_threshold: 10,
            flood_threshold: 600,
            tighten_factor: 0.5,
            deny_after_tightenings: 3,
            deny_duration_ms: 5 * 60 * 1000,
            health_check_interval_ms: 1_000,
            probe_cooldown_ms: 30_000,
            probe_interval_ms: 5_000,
            probe_timeout_ms: 5_000,
            probes_required: 3,
            alert_history: 256,
        }
    }
}

impl Config {
    /// Parse a config from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Reject values that would break scheduling invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dispatch.retry.jitter_ratio) {
            return Err(ConfigError::Invalid(
                "dispatch.retry.jitter_ratio must be within [0, 1]".to_string(),
            ));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.server.config_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.config_poll_interval_ms must be positive".to_string(),
            ));
        }
        let multiplier = self.dispatch.timeout_multiplier;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(ConfigError::Invalid(
                "dispatch.timeout_multiplier must be a positive number".to_string(),
            ));
        }
        for (name, class) in &self.policy.classes {
            let refill = class.rate_limit.refill_per_sec;
            if !refill.is_finite() || refill < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "policy.classes.{name}.rate_limit.refill_per_sec must be zero or more"
                )));
            }
        }
        if self.registry.quarantine_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "registry.quarantine_failure_threshold must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.registry.success_rate_alpha) {
            return Err(ConfigError::Invalid(
                "registry.success_rate_alpha must be within [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.resilience.tighten_factor) {
            return Err(ConfigError::Invalid(
                "resilience.tighten_factor must be within [0, 1]".to_string(),
            ));
        }
        if self.resilience.probes_required == 0 {
            return Err(ConfigError::Invalid(
                "resilience.probes_required must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared, hot-reloadable access to the current [`Config`].
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<Config>>>,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    /// Wrap an in-memory config.
    pub fn new(config: Config) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self {
            tx: Arc::new(tx),
            path: None,
        }
    }

    /// Load from a file and remember the path for reloads.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Config::from_file(&path)?;
        let mut handle = Self::new(config);
        handle.path = Some(path);
        Ok(handle)
    }

    /// Current snapshot.
    pub fn current(&self) -> Arc<Config> {
        self.tx.borrow().clone()
    }

    /// Receive every future snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }

    /// Validate and publish a new config.
    pub fn replace(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        self.tx.send_replace(Arc::new(config));
        info!("Configuration updated");
        Ok(())
    }

    /// Re-read the config file.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoFile)?;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        self.replace(Config::from_json(&text)?)
    }

    /// Poll the config file's modification time and reload on change.
    ///
    /// A file that fails to parse or validate is logged and ignored; the
    /// previous snapshot stays in effect.
    pub async fn watch_file(self, cancel: CancellationToken) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let mut last_modified = modified_at(&path).await;

        loop {
            let interval = Duration::from_millis(self.current().server.config_poll_interval_ms);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let modified = modified_at(&path).await;
            if modified.is_none() || modified == last_modified {
                continue;
            }
            last_modified = modified;

            match self.reload().await {
                Ok(()) => info!(path = %path.display(), "Configuration reloaded"),
                Err(e) => error!(path = %path.display(), error = %e, "Rejected config reload"),
            }
        }
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}
