//! Reconnect backoff scheduling.
//!
//! The transport does not retry on its own; the breaker layer owns the
//! retry cadence and hands out delays from this policy.

use std::time::Duration;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay for the first retry.
    pub base_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry `attempt` (1-based).
    ///
    /// attempt=1 -> base, attempt=2 -> 2*base, attempt=3 -> 4*base, ...
    /// capped at `max_delay`, plus 0-1000ms of jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let exponent = attempt.saturating_sub(1).min(10);
        let delay = base_ms.saturating_mul(1u64 << exponent).min(max_ms);

        Duration::from_millis(delay + jitter_ms())
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// 0-1000ms of jitter from the system clock's sub-second noise.
fn jitter_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as u64
}
