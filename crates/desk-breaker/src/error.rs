//! Breaker error types.

use std::time::Duration;
use thiserror::Error;

/// Result of a breaker-wrapped call.
///
/// `Open` means "temporarily unavailable": the wrapped operation was
/// not invoked. `Operation` carries the wrapped operation's own error.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit open, retry in {retry_after:?}")]
    Open { retry_after: Duration },

    #[error(transparent)]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// True when the breaker rejected the call without invoking it.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}
