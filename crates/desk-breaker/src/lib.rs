//! Circuit breaker around the platform connection.
//!
//! Stops hammering a failing server: after a threshold of consecutive
//! failures the breaker opens and calls fail immediately without
//! touching the network, then a single trial call probes recovery once
//! the cool-down elapses.

pub mod backoff;
pub mod breaker;
pub mod error;

pub use backoff::BackoffPolicy;
pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use error::BreakerError;
