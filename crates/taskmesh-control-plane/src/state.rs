//! Shared application state.
//!
//! Wires the components together and owns the background loops. After every
//! scheduling tick the registry's accounting is audited. A violation raises
//! an alert and is repaired: health comes back from the last consistent
//! snapshot and load is recounted from the reservations of live work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use taskmesh_core::api::{RegisterBackendRequest, SubmitRequest};
use taskmesh_core::{BackendHealth, BackendId, BackendInfo, TaskId};

use crate::admission::{AdmissionController, Rejection};
use crate::config::ConfigHandle;
use crate::dispatch::{BackendExecutor, DispatchAck, LifecycleTracker, MailboxExecutor};
use crate::registry::{BackendRegistry, RegistryError, RegistrySnapshot};
use crate::resilience::{
    AdmissionSignal, Alert, AlertHub, AlertKind, AnomalyDetector, HealthRelay, HealthSignal,
    RecoveryProber,
};
use crate::scheduler::{Scheduler, SeqGenerator, TickOutcome};

const SIGNAL_BUFFER: usize = 1024;

struct SignalReceivers {
    health: mpsc::Receiver<HealthSignal>,
    admission: mpsc::Receiver<AdmissionSignal>,
}

/// Shared application state.
pub struct AppState {
    pub config: ConfigHandle,
    pub registry: Arc<BackendRegistry>,
    pub admission: Arc<AdmissionController>,
    pub scheduler: Arc<Scheduler>,
    pub tracker: Arc<LifecycleTracker>,
    pub alerts: Arc<AlertHub>,

    /// Mailboxes of backends registered over HTTP.
    mailboxes: RwLock<HashMap<BackendId, Arc<MailboxExecutor>>>,

    /// Last registry state that passed the audit.
    last_good: Mutex<RegistrySnapshot>,

    /// Taken by `start`.
    receivers: Mutex<Option<SignalReceivers>>,

    cancel: CancellationToken,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    ///
    /// Health signals queue until [`AppState::start`] runs the relay, and
    /// dispatch workers wait once the queue is full.
    pub fn new(config: ConfigHandle) -> Arc<Self> {
        let current = config.current();
        let seq = SeqGenerator::new();
        let (health_tx, health_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (admission_tx, admission_rx) = mpsc::channel(SIGNAL_BUFFER);

        let registry = Arc::new(BackendRegistry::new(config.clone()));
        let scheduler = Arc::new(Scheduler::new(registry.clone(), config.clone(), seq.clone()));
        let tracker = Arc::new(LifecycleTracker::new(
            registry.clone(),
            scheduler.clone(),
            config.clone(),
            seq,
            health_tx,
        ));
        let admission = Arc::new(AdmissionController::new(config.clone(), admission_tx));
        let alerts = Arc::new(AlertHub::new(current.resilience.alert_history));

        Arc::new(Self {
            config,
            registry,
            admission,
            scheduler,
            tracker,
            alerts,
            mailboxes: RwLock::new(HashMap::new()),
            last_good: Mutex::new(RegistrySnapshot::default()),
            receivers: Mutex::new(Some(SignalReceivers {
                health: health_rx,
                admission: admission_rx,
            })),
            cancel: CancellationToken::new(),
        })
    }

    /// Admit a submission and hand it to the tracker.
    pub async fn submit(&self, req: SubmitRequest) -> Result<TaskId, Rejection> {
        let task = self.admission.admit(req).await?;
        self.tracker
            .track(task)
            .await
            .map_err(|e| Rejection::malformed(e.to_string()))
    }

    /// One scheduling pass: dispatch new assignments, fail unplaceable
    /// tasks, then audit the registry.
    pub async fn run_tick(&self) -> TickOutcome {
        let outcome = self.scheduler.tick().await;

        for task_id in &outcome.unschedulable {
            self.tracker.mark_unschedulable(task_id).await;
        }
        for assignment in &outcome.assignments {
            let ack = self.tracker.dispatch(assignment.clone()).await;
            if ack != DispatchAck::Accepted {
                debug!(seq = %assignment.seq, ?ack, "Assignment not dispatched");
            }
        }

        self.check_invariants().await;
        outcome
    }

    /// Audit registry accounting and repair it on failure.
    pub async fn check_invariants(&self) -> bool {
        match self.registry.audit().await {
            Ok(()) => {
                *self.last_good.lock().await = self.registry.snapshot().await;
                true
            }
            Err(e) => {
                error!(error = %e, "Registry invariant violated, restoring last snapshot");
                self.alerts
                    .raise(Alert::new(AlertKind::InvariantViolation, "registry", e.to_string()))
                    .await;
                let snapshot = self.last_good.lock().await.clone();
                let live = self.tracker.live_assignments().await;
                self.registry.restore(&snapshot, |r| live.holds(r)).await;
                false
            }
        }
    }

    /// Register (or refresh) a backend that pulls work over HTTP.
    pub async fn register_backend(&self, req: RegisterBackendRequest) -> Result<(), RegistryError> {
        let mailbox = {
            let mut mailboxes = self.mailboxes.write().await;
            mailboxes
                .entry(req.id.clone())
                .or_insert_with(|| Arc::new(MailboxExecutor::new()))
                .clone()
        };
        let mut info = BackendInfo::new(req.id, req.capability_tags, req.capacity);
        info.labels = req.labels;
        self.register_with_executor(info, mailbox).await
    }

    /// Register a backend with its own executor.
    pub async fn register_with_executor(
        &self,
        info: BackendInfo,
        executor: Arc<dyn BackendExecutor>,
    ) -> Result<(), RegistryError> {
        self.registry.register(info, executor).await?;
        self.scheduler.notify();
        Ok(())
    }

    /// Remove a backend; its in-flight work is retried elsewhere.
    pub async fn deregister_backend(&self, id: &BackendId) -> Result<(), RegistryError> {
        let orphaned = self.registry.deregister(id).await?;
        let failed_over = self.tracker.fail_backend(id, "backend deregistered").await;
        self.mailboxes.write().await.remove(id);
        info!(
            backend_id = %id,
            reservations = orphaned.len(),
            failed_over,
            "Backend removed"
        );
        Ok(())
    }

    pub async fn heartbeat(&self, id: &BackendId, load: u32) -> Result<BackendHealth, RegistryError> {
        let health = self.registry.heartbeat(id, load).await?;
        self.scheduler.notify();
        Ok(health)
    }

    pub async fn mailbox(&self, id: &BackendId) -> Option<Arc<MailboxExecutor>> {
        self.mailboxes.read().await.get(id).cloned()
    }

    /// Spawn the ticker, resilience loops, and config watcher.
    /// Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let Some(receivers) = self.receivers.lock().await.take() else {
            return;
        };

        let ticker = Arc::clone(self);
        tokio::spawn(async move { ticker.run_ticker().await });

        let relay = HealthRelay::new(
            self.registry.clone(),
            self.tracker.clone(),
            self.alerts.clone(),
            self.config.clone(),
        );
        tokio::spawn(relay.run(receivers.health, self.cancel.clone()));

        let detector = AnomalyDetector::new(
            self.admission.clone(),
            self.alerts.clone(),
            self.config.clone(),
        );
        tokio::spawn(detector.run(receivers.admission, self.cancel.clone()));

        let prober = RecoveryProber::new(
            self.registry.clone(),
            self.tracker.clone(),
            self.alerts.clone(),
            self.config.clone(),
        );
        tokio::spawn(prober.run(self.cancel.clone()));

        tokio::spawn(self.config.clone().watch_file(self.cancel.clone()));
        info!("Background loops started");
    }

    async fn run_ticker(&self) {
        loop {
            let interval = Duration::from_millis(self.config.current().scheduler.tick_interval_ms);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.scheduler.woken() => {}
            }
            self.run_tick().await;
        }
        info!("Scheduler ticker stopped");
    }

    /// Stop every background loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
