//! Retry backoff.

use gantry_core::workflow::RetryPolicy;
use std::time::Duration;

/// Delay to wait after failed attempt number `attempt` (1-based).
///
/// Doubles from `base_delay_ms` on every attempt and never exceeds `ceiling`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, ceiling: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let factor = 1u64 << exponent;
    let millis = policy.base_delay_ms.saturating_mul(factor);
    Duration::from_millis(millis).min(ceiling)
}

/// Total attempts allowed for a step, counting the first run.
pub fn max_attempts(policy: Option<&RetryPolicy>) -> u32 {
    policy.map(|p| p.max_attempts.max(1)).unwrap_or(1)
}
