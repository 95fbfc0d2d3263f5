//! Recovery prober for quarantined backends.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use taskmesh_core::{BackendHealth, BackendId};

use super::{Alert, AlertHub, AlertKind};
use crate::config::ConfigHandle;
use crate::dispatch::LifecycleTracker;
use crate::registry::BackendRegistry;

pub struct RecoveryProber {
    registry: Arc<BackendRegistry>,
    tracker: Arc<LifecycleTracker>,
    alerts: Arc<AlertHub>,
    config: ConfigHandle,
}

impl RecoveryProber {
    pub fn new(
        registry: Arc<BackendRegistry>,
        tracker: Arc<LifecycleTracker>,
        alerts: Arc<AlertHub>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            registry,
            tracker,
            alerts,
            config,
        }
    }

    /// Probe every quarantined backend past its cooldown once.
    /// Returns the backends restored this round.
    pub async fn probe_round(&self) -> Vec<BackendId> {
        let config = self.config.current();
        let cfg = &config.resilience;
        let cooldown = Duration::from_millis(cfg.probe_cooldown_ms);
        let timeout = Duration::from_millis(cfg.probe_timeout_ms);
        let mut restored = Vec::new();

        for id in self.registry.probe_candidates(cooldown).await {
            let passed = self.tracker.probe(&id, timeout).await;
            let streak = match self.registry.record_probe(&id, passed).await {
                Ok(streak) => streak,
                Err(e) => {
                    debug!(backend_id = %id, error = %e, "Probe result dropped");
                    continue;
                }
            };
            debug!(backend_id = %id, passed, streak, "Probe recorded");
            if !passed || streak < cfg.probes_required {
                continue;
            }

            if self
                .registry
                .mark_health(&id, BackendHealth::Healthy)
                .await
                .is_ok()
            {
                self.alerts
                    .raise(Alert::new(
                        AlertKind::BackendRestored,
                        &id,
                        format!("{streak} consecutive probes succeeded"),
                    ))
                    .await;
                restored.push(id);
            }
        }
        restored
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Recovery prober started");
        loop {
            let interval =
                Duration::from_millis(self.config.current().resilience.probe_interval_ms.max(1));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    for id in self.probe_round().await {
                        info!(backend_id = %id, "Backend restored");
                    }
                }
            }
        }
        info!("Recovery prober stopped");
    }
}
