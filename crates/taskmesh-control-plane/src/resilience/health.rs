//! Health relay: drives backend health transitions.
//!
//! - Healthy -> Degraded on a failed dispatch or heartbeat silence.
//! - Degraded -> Healthy on a successful dispatch (or, in the registry, on a
//!   resumed heartbeat).
//! - any -> Quarantined once consecutive failures reach the threshold; the
//!   backend's in-flight assignments are failed over immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use taskmesh_core::{BackendHealth, BackendId};

use super::{Alert, AlertHub, AlertKind, HealthSignal};
use crate::config::ConfigHandle;
use crate::dispatch::LifecycleTracker;
use crate::registry::BackendRegistry;

pub struct HealthRelay {
    registry: Arc<BackendRegistry>,
    tracker: Arc<LifecycleTracker>,
    alerts: Arc<AlertHub>,
    config: ConfigHandle,
}

impl HealthRelay {
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

    pub async fn handle(&self, signal: HealthSignal) {
        match signal {
            HealthSignal::Outcome {
                backend_id,
                success,
                consecutive_failures,
            } => {
                let threshold = self.config.current().registry.quarantine_failure_threshold;
                let Some(backend) = self.registry.get(&backend_id).await else {
                    return;
                };
                match (success, backend.health) {
                    (false, BackendHealth::Quarantined) => {}
                    (false, _) if consecutive_failures >= threshold => {
                        self.quarantine(
                            &backend_id,
                            format!("{consecutive_failures} consecutive dispatch failures"),
                        )
                        .await;
                    }
                    (false, BackendHealth::Healthy) => {
                        self.transition(&backend_id, BackendHealth::Degraded).await;
                        self.alerts
                            .raise(Alert::new(
                                AlertKind::BackendDegraded,
                                &backend_id,
                                format!("dispatch failure ({consecutive_failures} in a row)"),
                            ))
                            .await;
                    }
                    (true, BackendHealth::Degraded) => {
                        self.transition(&backend_id, BackendHealth::Healthy).await;
                    }
                    _ => {}
                }
            }
            HealthSignal::Timeout {
                backend_id,
                task_id,
                seq,
            } => {
                self.alerts
                    .raise(Alert::new(
                        AlertKind::DispatchTimeout,
                        &backend_id,
                        format!("task {task_id} (assignment {seq}) missed its deadline"),
                    ))
                    .await;
            }
        }
    }

    /// Quarantine a backend and fail over its in-flight work.
    pub async fn quarantine(&self, backend_id: &BackendId, reason: String) {
        match self
            .registry
            .mark_health(backend_id, BackendHealth::Quarantined)
            .await
        {
            Ok(BackendHealth::Quarantined) | Err(_) => return,
            Ok(_) => {}
        }
        let failed_over = self
            .tracker
            .fail_backend(backend_id, "backend quarantined")
            .await;
        self.alerts
            .raise(Alert::new(
                AlertKind::BackendQuarantined,
                backend_id,
                format!("{reason}; {failed_over} assignments failed over"),
            ))
            .await;
    }

    /// Degrade backends whose heartbeat went silent.
    pub async fn sweep(&self) -> Vec<BackendId> {
        let timeout = Duration::from_millis(self.config.current().registry.heartbeat_timeout_ms);
        let degraded = self.registry.mark_stale(timeout).await;
        for id in &degraded {
            self.alerts
                .raise(Alert::new(
                    AlertKind::BackendDegraded,
                    id,
                    format!("no heartbeat for {}ms", timeout.as_millis()),
                ))
                .await;
        }
        degraded
    }

    async fn transition(&self, backend_id: &BackendId, status: BackendHealth) {
        if let Err(e) = self.registry.mark_health(backend_id, status).await {
            debug!(backend_id = %backend_id, error = %e, "Health transition skipped");
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<HealthSignal>, cancel: CancellationToken) {
        info!("Health relay started");
        let period = |config: &ConfigHandle| {
            Duration::from_millis(config.current().resilience.health_check_interval_ms.max(1))
        };
        let mut next_sweep = Instant::now() + period(&self.config);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = rx.recv() => match signal {
                    Some(signal) => self.handle(signal).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(next_sweep) => {
                    self.sweep().await;
                    next_sweep = Instant::now() + period(&self.config);
                }
            }
        }
        info!("Health relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatch::testing::ScriptedExecutor;
    use crate::scheduler::{Scheduler, SeqGenerator};
    use std::collections::BTreeSet;
    use taskmesh_core::BackendInfo;

    async fn relay(config: Config) -> (HealthRelay, Arc<BackendRegistry>, Arc<AlertHub>) {
        let config = ConfigHandle::new(config);
        let seq = SeqGenerator::new();
        let registry = Arc::new(BackendRegistry::new(config.clone()));
        let scheduler = Arc::new(Scheduler::new(registry.clone(), config.clone(), seq.clone()));
        let (tx, _rx) = mpsc::channel(8);
        let tracker = Arc::new(LifecycleTracker::new(
            registry.clone(),
            scheduler,
            config.clone(),
            seq,
            tx,
        ));
        let alerts = Arc::new(AlertHub::new(16));
        registry
            .register(
                BackendInfo::new("b1", ["x"], 1),
                Arc::new(ScriptedExecutor::accepting()),
            )
            .await
            .unwrap();
        (
            HealthRelay::new(registry.clone(), tracker, alerts.clone(), config),
            registry,
            alerts,
        )
    }

    fn outcome(success: bool, consecutive_failures: u32) -> HealthSignal {
        HealthSignal::Outcome {
            backend_id: BackendId::new("b1"),
            success,
            consecutive_failures,
        }
    }

    async fn health(registry: &BackendRegistry) -> BackendHealth {
        registry.get(&BackendId::new("b1")).await.unwrap().health
    }

    #[tokio::test]
    async fn test_threshold_failures_quarantine() {
        let (relay, registry, alerts) = relay(Config::default()).await;

        relay.handle(outcome(false, 1)).await;
        assert_eq!(health(&registry).await, BackendHealth::Degraded);
        relay.handle(outcome(false, 2)).await;
        assert_eq!(health(&registry).await, BackendHealth::Degraded);
        relay.handle(outcome(false, 3)).await;
        assert_eq!(health(&registry).await, BackendHealth::Quarantined);

        let tags: BTreeSet<String> = ["x".to_string()].into_iter().collect();
        assert!(registry.list_eligible(&tags).await.is_empty());
        let kinds: Vec<AlertKind> = alerts.recent().await.into_iter().map(|a| a.kind).collect();
        assert_eq!(kinds.last(), Some(&AlertKind::BackendQuarantined));
    }

    #[tokio::test]
    async fn test_success_heals_degraded_backend() {
        let (relay, registry, _alerts) = relay(Config::default()).await;
        relay.handle(outcome(false, 1)).await;
        relay.handle(outcome(true, 0)).await;
        assert_eq!(health(&registry).await, BackendHealth::Healthy);
    }

    #[tokio::test]
    async fn test_success_does_not_lift_quarantine() {
        let (relay, registry, _alerts) = relay(Config::default()).await;
        relay.handle(outcome(false, 3)).await;
        relay.handle(outcome(true, 0)).await;
        assert_eq!(health(&registry).await, BackendHealth::Quarantined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_degrades_silent_backends() {
        let mut config = Config::default();
        config.registry.heartbeat_timeout_ms = 100;
        let (relay, registry, alerts) = relay(config).await;

        assert!(relay.sweep().await.is_empty());
        tokio::time::advance(Duration::from_millis(101)).await;
        assert_eq!(relay.sweep().await, vec![BackendId::new("b1")]);
        assert_eq!(health(&registry).await, BackendHealth::Degraded);
        assert_eq!(alerts.recent().await.len(), 1);
    }
}
