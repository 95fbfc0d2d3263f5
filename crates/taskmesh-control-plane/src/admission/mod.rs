//! Admission controller.
//!
//! Requests pass three gates in order: structural validation, the caller's
//! token bucket, then the policy rules. The first failing gate decides the
//! rejection code. Admission never touches the backend registry.

mod rate_limit;

pub use rate_limit::{RateLimiter, Throttle};

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskmesh_core::api::{RejectionResponse, SubmitRequest};
use taskmesh_core::{CallerId, RejectionCode, Task, TaskSpec};

use crate::config::{AdmissionConfig, ConfigHandle};
use crate::resilience::AdmissionSignal;

const MAX_ID_LEN: usize = 128;

/// A refused submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct Rejection {
    pub code: RejectionCode,
    pub message: String,
}

impl Rejection {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            code: RejectionCode::MalformedRequest,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            code: RejectionCode::RateLimited,
            message: message.into(),
        }
    }

    pub fn policy_denied(message: impl Into<String>) -> Self {
        Self {
            code: RejectionCode::PolicyDenied,
            message: message.into(),
        }
    }

    pub fn to_response(&self) -> RejectionResponse {
        RejectionResponse {
            code: self.code,
            message: self.message.clone(),
        }
    }
}

/// Check that an identifier is non-empty, bounded, and made of
/// `[A-Za-z0-9._-]`.
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), Rejection> {
    if value.is_empty() {
        return Err(Rejection::malformed(format!("{kind} cannot be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(Rejection::malformed(format!(
            "{kind} exceeds {MAX_ID_LEN} characters"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Rejection::malformed(format!(
            "{kind} must contain only alphanumeric characters, '-', '_' and '.'"
        )));
    }
    Ok(())
}

/// Structural checks. Returns the decoded task spec.
pub fn validate_request(req: &SubmitRequest, limits: &AdmissionConfig) -> Result<TaskSpec, Rejection> {
    validate_identifier("callerId", req.caller_id.as_str())?;
    if let Some(task_id) = &req.task_id {
        validate_identifier("taskId", task_id.as_str())?;
    }

    if req.capability_tags.len() > limits.max_capability_tags {
        return Err(Rejection::malformed(format!(
            "at most {} capability tags allowed",
            limits.max_capability_tags
        )));
    }
    if let Some(bad) = req
        .capability_tags
        .iter()
        .find(|t| t.is_empty() || t.chars().any(char::is_whitespace))
    {
        return Err(Rejection::malformed(format!("invalid capability tag '{bad}'")));
    }

    if req.estimated_duration_ms <= 0 {
        return Err(Rejection::malformed("estimatedDurationMs must be positive"));
    }
    let estimated_duration_ms = req.estimated_duration_ms as u64;
    if estimated_duration_ms > limits.max_estimated_duration_ms {
        return Err(Rejection::malformed(format!(
            "estimatedDurationMs exceeds {}",
            limits.max_estimated_duration_ms
        )));
    }

    let payload = STANDARD
        .decode(&req.payload)
        .map_err(|e| Rejection::malformed(format!("payload is not valid base64: {e}")))?;
    if payload.len() > limits.max_payload_bytes {
        return Err(Rejection::malformed(format!(
            "payload of {} bytes exceeds {}",
            payload.len(),
            limits.max_payload_bytes
        )));
    }

    Ok(TaskSpec::new(req.capability_tags.iter().cloned())
        .with_priority(req.priority)
        .with_estimated_duration_ms(estimated_duration_ms)
        .with_payload(payload))
}

/// Validates and authorizes task submissions.
pub struct AdmissionController {
    config: ConfigHandle,
    limiter: Mutex<RateLimiter>,
    signals: mpsc::Sender<AdmissionSignal>,
}

impl AdmissionController {
    pub fn new(config: ConfigHandle, signals: mpsc::Sender<AdmissionSignal>) -> Self {
        Self {
            config,
            limiter: Mutex::new(RateLimiter::new()),
            signals,
        }
    }

    /// Admit a request, producing a `Pending` task.
    pub async fn admit(&self, req: SubmitRequest) -> Result<Task, Rejection> {
        let caller_id = req.caller_id.clone();
        let result = self.evaluate(req).await;

        match &result {
            Ok(task) => debug!(caller_id = %caller_id, task_id = %task.id, "Submission admitted"),
            Err(r) => info!(caller_id = %caller_id, code = %r.code, reason = %r.message, "Submission rejected"),
        }
        let signal = AdmissionSignal {
            caller_id,
            rejected: result.as_ref().err().map(|r| r.code),
        };
        if let Err(e) = self.signals.try_send(signal) {
            warn!(error = %e, "Admission signal dropped");
        }
        result
    }

    async fn evaluate(&self, req: SubmitRequest) -> Result<Task, Rejection> {
        let config = self.config.current();
        let spec = validate_request(&req, &config.admission)?;

        let class = config.policy.class_for(&req.caller_id);
        self.limiter
            .lock()
            .await
            .check(&req.caller_id, &class.rate_limit, Instant::now())
            .map_err(|t| match t {
                Throttle::RateLimited => Rejection::rate_limited(format!(
                    "caller {} exceeded its rate limit",
                    req.caller_id
                )),
                Throttle::Denied => Rejection::policy_denied(format!(
                    "caller {} is temporarily denied",
                    req.caller_id
                )),
            })?;

        config
            .policy
            .evaluate(&req.caller_id, &spec)
            .map_err(Rejection::policy_denied)?;

        let task = Task::new(req.caller_id, spec);
        Ok(match req.task_id {
            Some(id) => task.with_id(id),
            None => task,
        })
    }

    /// Scale down a caller's rate limit. Returns the new multiplier.
    pub async fn tighten(&self, caller: &CallerId, factor: f64) -> f64 {
        let penalty = self
            .limiter
            .lock()
            .await
            .tighten(caller, factor, Instant::now());
        warn!(caller_id = %caller, penalty, "Caller rate limit tightened");
        penalty
    }

    /// Refuse every submission from `caller` until `until`.
    pub async fn deny(&self, caller: &CallerId, until: Instant) {
        self.limiter
            .lock()
            .await
            .deny(caller, until, Instant::now());
        warn!(caller_id = %caller, "Caller denied");
    }

    /// Drop rate-limit state for callers that have gone quiet.
    pub async fn evict_idle(&self) -> usize {
        let config = self.config.current();
        self.limiter
            .lock()
            .await
            .evict_idle(Instant::now(), |caller| config.policy.class_for(caller).rate_limit)
    }

    pub async fn is_denied(&self, caller: &CallerId) -> bool {
        self.limiter.lock().await.is_denied(caller, Instant::now())
    }

    pub async fn penalty(&self, caller: &CallerId) -> f64 {
        self.limiter.lock().await.penalty(caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;
    use taskmesh_core::{CallerClass, PolicyRule, Priority, RateLimit, TaskId, TaskState};

    fn request(caller: &str, tags: &[&str]) -> SubmitRequest {
        SubmitRequest {
            task_id: None,
            caller_id: CallerId::new(caller),
            capability_tags: tags.iter().map(|s| s.to_string()).collect(),
            priority: Priority::Normal,
            estimated_duration_ms: 1_000,
            payload: STANDARD.encode(b"work"),
        }
    }

    fn controller(config: Config) -> (AdmissionController, mpsc::Receiver<AdmissionSignal>) {
        let (tx, rx) = mpsc::channel(64);
        (AdmissionController::new(ConfigHandle::new(config), tx), rx)
    }

    #[tokio::test]
    async fn test_admit_creates_pending_task() {
        let (admission, mut signals) = controller(Config::default());
        let task = admission.admit(request("alice", &["gpu"])).await.unwrap();

        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.spec.payload, b"work");
        assert!(task.spec.capability_tags.contains("gpu"));

        let signal = signals.try_recv().unwrap();
        assert_eq!(signal.caller_id, CallerId::new("alice"));
        assert!(signal.rejected.is_none());
    }

    #[tokio::test]
    async fn test_caller_supplied_task_id_is_kept() {
        let (admission, _rx) = controller(Config::default());
        let mut req = request("alice", &["x"]);
        req.task_id = Some(TaskId::new("job-1"));
        assert_eq!(admission.admit(req).await.unwrap().id, TaskId::new("job-1"));
    }

    #[tokio::test]
    async fn test_structural_errors_are_malformed() {
        let (admission, _rx) = controller(Config::default());

        let mut zero = request("alice", &["x"]);
        zero.estimated_duration_ms = 0;
        let mut bad_payload = request("alice", &["x"]);
        bad_payload.payload = "***".to_string();
        let bad_caller = request("bad caller", &["x"]);
        let blank_tag = request("alice", &[""]);

        for req in [zero, bad_payload, bad_caller, blank_tag] {
            let err = admission.admit(req).await.unwrap_err();
            assert_eq!(err.code, RejectionCode::MalformedRequest);
        }
    }

    #[tokio::test]
    async fn test_payload_size_limit() {
        let mut config = Config::default();
        config.admission.max_payload_bytes = 2;
        let (admission, _rx) = controller(config);
        let err = admission.admit(request("alice", &["x"])).await.unwrap_err();
        assert_eq!(err.code, RejectionCode::MalformedRequest);
    }

    #[tokio::test]
    async fn test_malformed_wins_over_rate_limit() {
        let mut config = Config::default();
        config.policy.classes.insert(
            "standard".to_string(),
            CallerClass {
                rate_limit: RateLimit {
                    refill_per_sec: 0.0,
                    burst: 1,
                },
                priority_ceiling: Priority::High,
            },
        );
        let (admission, _rx) = controller(config);

        admission.admit(request("alice", &["x"])).await.unwrap();
        let limited = admission.admit(request("alice", &["x"])).await.unwrap_err();
        assert_eq!(limited.code, RejectionCode::RateLimited);

        let mut malformed = request("alice", &["x"]);
        malformed.estimated_duration_ms = -5;
        let err = admission.admit(malformed).await.unwrap_err();
        assert_eq!(err.code, RejectionCode::MalformedRequest);
    }

    #[tokio::test]
    async fn test_policy_denied_after_rate_limit_passes() {
        let mut config = Config::default();
        config.policy.rules.push(PolicyRule::DenyTags {
            tags: ["forbidden".to_string()].into_iter().collect(),
        });
        let (admission, mut signals) = controller(config);

        let err = admission
            .admit(request("alice", &["forbidden"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, RejectionCode::PolicyDenied);
        assert_eq!(
            signals.try_recv().unwrap().rejected,
            Some(RejectionCode::PolicyDenied)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_caller_is_policy_denied() {
        let (admission, _rx) = controller(Config::default());
        let caller = CallerId::new("mallory");
        admission
            .deny(&caller, Instant::now() + Duration::from_secs(10))
            .await;
        assert!(admission.is_denied(&caller).await);

        let err = admission.admit(request("mallory", &["x"])).await.unwrap_err();
        assert_eq!(err.code, RejectionCode::PolicyDenied);
        assert_eq!(err.to_response().code, RejectionCode::PolicyDenied);
    }
}
