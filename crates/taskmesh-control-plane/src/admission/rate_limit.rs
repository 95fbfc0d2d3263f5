//! Per-caller token buckets.
//!
//! Limits come from the caller's policy class and are read on every check,
//! so a config reload changes refill rate and burst for existing buckets
//! too. A caller can be tightened (its limit scaled down) or denied until
//! a deadline; both are driven by the anomaly detector.

use std::collections::HashMap;

use tokio::time::Instant;

use taskmesh_core::{CallerId, RateLimit};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn try_take(&mut self, rate: f64, capacity: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct CallerState {
    bucket: Bucket,
    /// Multiplier applied to the class limit; 1.0 is untouched.
    penalty: f64,
    denied_until: Option<Instant>,
}

/// Why a caller was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    RateLimited,
    Denied,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    callers: HashMap<CallerId, CallerState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one token for `caller`.
    pub fn check(&mut self, caller: &CallerId, limit: &RateLimit, now: Instant) -> Result<(), Throttle> {
        let state = self
            .callers
            .entry(caller.clone())
            .or_insert_with(|| CallerState {
                bucket: Bucket::new(f64::from(limit.burst), now),
                penalty: 1.0,
                denied_until: None,
            });

        if let Some(until) = state.denied_until {
            if now < until {
                return Err(Throttle::Denied);
            }
            state.denied_until = None;
        }

        let rate = limit.refill_per_sec * state.penalty;
        let capacity = (f64::from(limit.burst) * state.penalty).max(1.0);
        if state.bucket.try_take(rate, capacity, now) {
            Ok(())
        } else {
            Err(Throttle::RateLimited)
        }
    }

    /// Scale the caller's limit by `factor`. Returns the new multiplier.
    pub fn tighten(&mut self, caller: &CallerId, factor: f64, now: Instant) -> f64 {
        let state = self.state_mut(caller, now);
        state.penalty = (state.penalty * factor).max(f64::EPSILON);
        state.bucket.tokens = state.bucket.tokens.min(1.0);
        state.penalty
    }

    /// Refuse every request from `caller` until `until`.
    pub fn deny(&mut self, caller: &CallerId, until: Instant, now: Instant) {
        self.state_mut(caller, now).denied_until = Some(until);
    }

    pub fn is_denied(&self, caller: &CallerId, now: Instant) -> bool {
        self.callers
            .get(caller)
            .and_then(|s| s.denied_until)
            .map(|until| now < until)
            .unwrap_or(false)
    }

    /// Current limit multiplier for `caller`.
    pub fn penalty(&self, caller: &CallerId) -> f64 {
        self.callers.get(caller).map(|s| s.penalty).unwrap_or(1.0)
    }

    /// Forget callers that would get the same treatment from a fresh bucket:
    /// no penalty, no live denial, and a bucket refilled to its burst.
    /// Returns how many were dropped.
    pub fn evict_idle<F>(&mut self, now: Instant, limit_for: F) -> usize
    where
        F: Fn(&CallerId) -> RateLimit,
    {
        let before = self.callers.len();
        self.callers.retain(|caller, state| {
            if state.penalty < 1.0 || state.denied_until.is_some_and(|until| now < until) {
                return true;
            }
            let limit = limit_for(caller);
            let elapsed = now.duration_since(state.bucket.last_refill).as_secs_f64();
            state.bucket.tokens + elapsed * limit.refill_per_sec < f64::from(limit.burst)
        });
        before - self.callers.len()
    }

    pub fn len(&self) -> usize {
        self.callers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }

    fn state_mut(&mut self, caller: &CallerId, now: Instant) -> &mut CallerState {
        self.callers
            .entry(caller.clone())
            .or_insert_with(|| CallerState {
                bucket: Bucket::new(0.0, now),
                penalty: 1.0,
                denied_until: None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limit(refill_per_sec: f64, burst: u32) -> RateLimit {
        RateLimit {
            refill_per_sec,
            burst,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let mut limiter = RateLimiter::new();
        let caller = CallerId::new("alice");
        let l = limit(2.0, 3);

        for _ in 0..3 {
            assert!(limiter.check(&caller, &l, Instant::now()).is_ok());
        }
        assert_eq!(
            limiter.check(&caller, &l, Instant::now()),
            Err(Throttle::RateLimited)
        );

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.check(&caller, &l, Instant::now()).is_ok());
        assert!(limiter.check(&caller, &l, Instant::now()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_callers_have_independent_buckets() {
        let mut limiter = RateLimiter::new();
        let l = limit(0.0, 1);
        assert!(limiter.check(&CallerId::new("a"), &l, Instant::now()).is_ok());
        assert!(limiter.check(&CallerId::new("b"), &l, Instant::now()).is_ok());
        assert!(limiter.check(&CallerId::new("a"), &l, Instant::now()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tighten_slows_refill() {
        let mut limiter = RateLimiter::new();
        let caller = CallerId::new("alice");
        let l = limit(4.0, 4);
        assert!(limiter.check(&caller, &l, Instant::now()).is_ok());

        assert_eq!(limiter.tighten(&caller, 0.5, Instant::now()), 0.5);
        // Bucket was cut to one token.
        assert!(limiter.check(&caller, &l, Instant::now()).is_ok());
        assert!(limiter.check(&caller, &l, Instant::now()).is_err());

        // Refill is now 2/s instead of 4/s.
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(limiter.check(&caller, &l, Instant::now()).is_err());
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(limiter.check(&caller, &l, Instant::now()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_callers_are_evicted() {
        let mut limiter = RateLimiter::new();
        let l = limit(1.0, 2);
        for name in ["idle", "busy", "tight", "denied"] {
            assert!(limiter.check(&CallerId::new(name), &l, Instant::now()).is_ok());
        }
        limiter.tighten(&CallerId::new("tight"), 0.5, Instant::now());
        limiter.deny(
            &CallerId::new("denied"),
            Instant::now() + Duration::from_secs(60),
            Instant::now(),
        );

        // One token back for everyone; "busy" spends it again.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check(&CallerId::new("busy"), &l, Instant::now()).is_ok());

        assert_eq!(limiter.evict_idle(Instant::now(), |_| l), 1);
        assert_eq!(limiter.len(), 3);
        assert_eq!(limiter.penalty(&CallerId::new("tight")), 0.5);
        assert!(limiter.is_denied(&CallerId::new("denied"), Instant::now()));

        // A returning caller starts with a full burst.
        for _ in 0..2 {
            assert!(limiter.check(&CallerId::new("idle"), &l, Instant::now()).is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deny_expires() {
        let mut limiter = RateLimiter::new();
        let caller = CallerId::new("mallory");
        let l = limit(10.0, 10);

        limiter.deny(&caller, Instant::now() + Duration::from_secs(60), Instant::now());
        assert!(limiter.is_denied(&caller, Instant::now()));
        assert_eq!(
            limiter.check(&caller, &l, Instant::now()),
            Err(Throttle::Denied)
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!limiter.is_denied(&caller, Instant::now()));
        assert!(limiter.check(&caller, &l, Instant::now()).is_ok());
    }
}
