//! Three-state circuit breaker.
//!
//! ```text
//!     CLOSED ──failures ≥ threshold──→ OPEN ──cool-down──→ HALF-OPEN
//!        ▲                                                     │
//!        │                    trial success                    │
//!        └─────────────────────────────────────────────────────┤
//!                                                   trial failure
//!                                                          │
//!                                                          ▼
//!                                                        OPEN
//! ```
//!
//! Failures only count while `Closed`; the transition to `Open` happens
//! exactly at the threshold. The `Open → HalfOpen` transition is lazy:
//! it is taken on the next call attempt after the cool-down, not by a
//! background timer.
//!
//! Concurrency policy for `HalfOpen`: exactly one caller wins the trial
//! slot under the transition lock and invokes the operation; concurrent
//! callers fail fast with [`BreakerError::Open`] rather than queue
//! behind the trial.

use crate::error::BreakerError;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Cool-down before a trial call is allowed.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics snapshot for health reporting.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub total_failures: u64,
    pub state: CircuitState,
    pub time_in_state: Duration,
}

/// Callback invoked on every state transition (from, to).
type TransitionHook = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Set whenever the breaker (re-)enters `Open`.
    opened_at: Option<Instant>,
    entered_state_at: Instant,
    /// A trial call is in flight (only meaningful in `HalfOpen`).
    trial_in_flight: bool,
}

/// How a call was admitted past the state check.
enum Admission {
    /// Normal call in `Closed`.
    Normal,
    /// The single trial call in `HalfOpen`.
    Trial,
}

/// Shared, thread-safe circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    on_transition: Option<TransitionHook>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                entered_state_at: Instant::now(),
                trial_in_flight: false,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            on_transition: None,
        }
    }

    /// Install a hook fired on every state transition, for surfacing
    /// healthy/degraded status to the outside.
    pub fn with_transition_hook(
        mut self,
        hook: impl Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.on_transition = Some(Box::new(hook));
        self
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            state: inner.state,
            time_in_state: inner.entered_state_at.elapsed(),
        }
    }

    /// Run `op` through the breaker.
    ///
    /// While `Open`, fails immediately with [`BreakerError::Open`]
    /// without invoking `op`.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let admission = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => Admission::Normal,
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if elapsed >= self.config.recovery_timeout {
                        self.transition(&mut inner, CircuitState::HalfOpen);
                        inner.trial_in_flight = true;
                        Admission::Trial
                    } else {
                        return Err(BreakerError::Open {
                            retry_after: self.config.recovery_timeout - elapsed,
                        });
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        // Another caller owns the trial slot.
                        return Err(BreakerError::Open {
                            retry_after: Duration::ZERO,
                        });
                    }
                    inner.trial_in_flight = true;
                    Admission::Trial
                }
            }
        };

        // The lock is NOT held across the operation.
        let result = op().await;

        let mut inner = self.inner.lock();
        match (&admission, &result) {
            (Admission::Trial, Ok(_)) => {
                info!("Trial call succeeded, closing circuit");
                inner.trial_in_flight = false;
                inner.consecutive_failures = 0;
                self.transition(&mut inner, CircuitState::Closed);
            }
            (Admission::Trial, Err(_)) => {
                warn!("Trial call failed, reopening circuit");
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                inner.trial_in_flight = false;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            (Admission::Normal, Ok(_)) => {
                if inner.state == CircuitState::Closed {
                    inner.consecutive_failures = 0;
                }
            }
            (Admission::Normal, Err(_)) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                // Failures only count while Closed.
                if inner.state == CircuitState::Closed {
                    inner.consecutive_failures += 1;
                    debug!(
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Recorded failure"
                    );
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        warn!(
                            failures = inner.consecutive_failures,
                            "Failure threshold reached, opening circuit"
                        );
                        inner.opened_at = Some(Instant::now());
                        self.transition(&mut inner, CircuitState::Open);
                    }
                }
            }
        }
        drop(inner);

        result.map_err(BreakerError::Operation)
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.entered_state_at = Instant::now();
        debug!(%from, %to, "Circuit transition");
        if let Some(hook) = &self.on_transition {
            hook(from, to);
        }
    }
}
