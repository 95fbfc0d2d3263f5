//! Per-caller abuse detection.
//!
//! Two signatures over a sliding window: repeated rejections (a caller that
//! keeps submitting requests admission turns down) and a submission flood.
//! Each detection tightens the caller's rate limit; once a caller has been
//! tightened `deny_after_tightenings` times the next detection denies it
//! for `deny_duration_ms`.
//!
//! Once per window the detector forgets callers with nothing left to
//! remember, both here and in the admission rate limiter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use taskmesh_core::CallerId;

use super::{AdmissionSignal, Alert, AlertHub, AlertKind};
use crate::admission::AdmissionController;
use crate::config::ConfigHandle;

/// What the detector did about a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum AnomalyAction {
    Tightened { penalty: f64 },
    Denied { for_ms: u64 },
}

#[derive(Debug, Default)]
struct CallerWindow {
    submissions: VecDeque<Instant>,
    rejections: VecDeque<Instant>,
    tightenings: u32,
}

impl CallerWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        for q in [&mut self.submissions, &mut self.rejections] {
            while q.front().is_some_and(|t| now.duration_since(*t) > window) {
                q.pop_front();
            }
        }
    }
}

pub struct AnomalyDetector {
    admission: Arc<AdmissionController>,
    alerts: Arc<AlertHub>,
    config: ConfigHandle,
    callers: HashMap<CallerId, CallerWindow>,
}

impl AnomalyDetector {
    pub fn new(admission: Arc<AdmissionController>, alerts: Arc<AlertHub>, config: ConfigHandle) -> Self {
        Self {
            admission,
            alerts,
            config,
            callers: HashMap::new(),
        }
    }

    /// Fold one admission outcome in and act if a signature matches.
    pub async fn observe(&mut self, signal: AdmissionSignal) -> Option<AnomalyAction> {
        let config = self.config.current();
        let cfg = &config.resilience;
        let now = Instant::now();

        let window = self.callers.entry(signal.caller_id.clone()).or_default();
        window.prune(now, Duration::from_millis(cfg.anomaly_window_ms));
        window.submissions.push_back(now);
        if signal.rejected.is_some() {
            window.rejections.push_back(now);
        }

        let signature = if cfg.rejection_threshold > 0
            && window.rejections.len() >= cfg.rejection_threshold as usize
        {
            "repeated rejections"
        } else if cfg.flood_threshold > 0 && window.submissions.len() >= cfg.flood_threshold as usize {
            "submission flood"
        } else {
            return None;
        };
        window.submissions.clear();
        window.rejections.clear();

        let caller = signal.caller_id;
        if window.tightenings >= cfg.deny_after_tightenings {
            window.tightenings = 0;
            let until = now + Duration::from_millis(cfg.deny_duration_ms);
            self.admission.deny(&caller, until).await;
            self.alerts
                .raise(Alert::new(
                    AlertKind::CallerDenied,
                    &caller,
                    format!("{signature}; denied for {}ms", cfg.deny_duration_ms),
                ))
                .await;
            return Some(AnomalyAction::Denied {
                for_ms: cfg.deny_duration_ms,
            });
        }

        window.tightenings += 1;
        let penalty = self.admission.tighten(&caller, cfg.tighten_factor).await;
        self.alerts
            .raise(Alert::new(
                AlertKind::RateTightened,
                &caller,
                format!("{signature}; rate limit scaled to {penalty:.3}"),
            ))
            .await;
        Some(AnomalyAction::Tightened { penalty })
    }

    /// Drop callers whose windows have emptied and who were never tightened.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let window = Duration::from_millis(self.config.current().resilience.anomaly_window_ms);
        let before = self.callers.len();
        self.callers.retain(|_, w| {
            w.prune(now, window);
            w.tightenings > 0 || !w.submissions.is_empty() || !w.rejections.is_empty()
        });
        before - self.callers.len()
    }

    pub fn tracked_callers(&self) -> usize {
        self.callers.len()
    }

    async fn sweep(&mut self) {
        let windows = self.evict_idle(Instant::now());
        let buckets = self.admission.evict_idle().await;
        if windows + buckets > 0 {
            debug!(windows, buckets, "Evicted idle callers");
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<AdmissionSignal>, cancel: CancellationToken) {
        info!("Anomaly detector started");
        let mut next_sweep = Instant::now();
        loop {
            let window = Duration::from_millis(self.config.current().resilience.anomaly_window_ms.max(1));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next_sweep + window) => {
                    self.sweep().await;
                    next_sweep = Instant::now();
                }
                signal = rx.recv() => match signal {
                    Some(signal) => {
                        if let Some(action) = self.observe(signal).await {
                            debug!(?action, "Anomaly handled");
                        }
                    }
                    None => break,
                },
            }
        }
        info!("Anomaly detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use taskmesh_core::RejectionCode;

    fn detector(config: Config) -> (AnomalyDetector, Arc<AdmissionController>, Arc<AlertHub>) {
        let handle = ConfigHandle::new(config);
        let (tx, _rx) = mpsc::channel(8);
        let admission = Arc::new(AdmissionController::new(handle.clone(), tx));
        let alerts = Arc::new(AlertHub::new(16));
        (
            AnomalyDetector::new(admission.clone(), alerts.clone(), handle),
            admission,
            alerts,
        )
    }

    fn rejected(caller: &str) -> AdmissionSignal {
        AdmissionSignal {
            caller_id: CallerId::new(caller),
            rejected: Some(RejectionCode::PolicyDenied),
        }
    }

    fn accepted(caller: &str) -> AdmissionSignal {
        AdmissionSignal {
            caller_id: CallerId::new(caller),
            rejected: None,
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.resilience.rejection_threshold = 3;
        config.resilience.flood_threshold = 0;
        config.resilience.deny_after_tightenings = 2;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_rejections_tighten_then_deny() {
        let (mut detector, admission, alerts) = detector(config());
        let caller = CallerId::new("mallory");

        let mut actions = Vec::new();
        for _ in 0..9 {
            if let Some(action) = detector.observe(rejected("mallory")).await {
                actions.push(action);
            }
        }

        assert_eq!(
            actions,
            vec![
                AnomalyAction::Tightened { penalty: 0.5 },
                AnomalyAction::Tightened { penalty: 0.25 },
                AnomalyAction::Denied { for_ms: 300_000 },
            ]
        );
        assert!(admission.is_denied(&caller).await);
        let kinds: Vec<AlertKind> = alerts.recent().await.into_iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::RateTightened,
                AlertKind::RateTightened,
                AlertKind::CallerDenied
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_outside_window_do_not_count() {
        let (mut detector, admission, _alerts) = detector(config());

        detector.observe(rejected("bob")).await;
        detector.observe(rejected("bob")).await;
        tokio::time::advance(Duration::from_millis(60_001)).await;
        assert!(detector.observe(rejected("bob")).await.is_none());
        assert_eq!(admission.penalty(&CallerId::new("bob")).await, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_traffic_is_not_abuse() {
        let (mut detector, _admission, _alerts) = detector(config());
        for _ in 0..50 {
            assert!(detector.observe(accepted("alice")).await.is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_callers_are_forgotten() {
        let (mut detector, _admission, _alerts) = detector(config());
        for i in 0..20 {
            detector.observe(accepted(&format!("caller-{i}"))).await;
        }
        for _ in 0..3 {
            detector.observe(rejected("mallory")).await;
        }
        assert_eq!(detector.tracked_callers(), 21);
        assert_eq!(detector.evict_idle(Instant::now()), 0);

        tokio::time::advance(Duration::from_millis(60_001)).await;
        assert_eq!(detector.evict_idle(Instant::now()), 20);
        // Escalation state survives the sweep.
        assert_eq!(detector.tracked_callers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_flood_tightens() {
        let mut config = config();
        config.resilience.flood_threshold = 5;
        let (mut detector, admission, _alerts) = detector(config);

        let mut hit = None;
        for _ in 0..5 {
            hit = detector.observe(accepted("burst")).await;
        }
        assert_eq!(hit, Some(AnomalyAction::Tightened { penalty: 0.5 }));
        assert_eq!(admission.penalty(&CallerId::new("burst")).await, 0.5);
    }
}
