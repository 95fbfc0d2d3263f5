//! Retry backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;

/// Exponential backoff before retry number `attempt` (1-based count of
/// failed attempts so far), capped at `max_backoff_ms` and jittered by
/// `jitter_ratio` in either direction.
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let raw = policy.base_backoff_ms.saturating_mul(1u64 << exp);
    let capped = raw.min(policy.max_backoff_ms) as f64;

    let jitter = policy.jitter_ratio.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
    } else {
        1.0
    };
    Duration::from_millis((capped * factor).round() as u64)
}
