//! Protocol error types.

use thiserror::Error;

/// A recognized but semantically wrong response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A position-update-typed response to an open-orders request. It
    /// does not represent a real position change and must never reach
    /// position state.
    PositionUpdateForOpenOrders,
    /// A market-data-typed response to a position request. Market data
    /// must not be reinterpreted as position data.
    MarketDataForPositions,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PositionUpdateForOpenOrders => {
                write!(f, "position update in response to open-orders request")
            }
            Self::MarketDataForPositions => {
                write!(f, "market data in response to positions request")
            }
        }
    }
}

impl ViolationKind {
    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PositionUpdateForOpenOrders => "position_update_for_open_orders",
            Self::MarketDataForPositions => "market_data_for_positions",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Required field missing or of the wrong shape. The message is
    /// dropped; the stream continues.
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },

    /// One of the documented protocol violations. Logged and dropped,
    /// never applied to state.
    #[error("protocol violation: {0}")]
    Violation(ViolationKind),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
