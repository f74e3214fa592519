//! State manager error types.

use desk_core::Qty;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("a position is already open")]
    PositionAlreadyOpen,

    #[error("no open position")]
    NoOpenPosition,

    #[error("invalid position quantity: {0}")]
    InvalidQuantity(Qty),

    #[error("direct position-field writes are not supported; use open_position/close_position")]
    UnsupportedOperation,
}

pub type StateResult<T> = Result<T, StateError>;
