//! State change notifications.

use chrono::{DateTime, Utc};
use desk_core::{OrderSide, Price, Qty, TradingMode};
use rust_decimal::Decimal;
use serde::Serialize;

/// What happened to the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionAction {
    Open,
    Close,
}

/// Position fields as carried by a notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub qty: Qty,
    pub avg_price: Price,
    pub side: OrderSide,
    pub mode: TradingMode,
    /// True when the position was discovered via reconciliation rather
    /// than a live order fill; its entry time is then unreliable.
    pub recovered_without_entry_time: bool,
    pub opened_at: DateTime<Utc>,
}

/// A state change notification.
///
/// Within one transaction, observers always see events in rank order:
/// mode, then balance, then position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StateEvent {
    ModeChanged(TradingMode),
    BalanceChanged {
        mode: TradingMode,
        balance: Decimal,
    },
    PositionChanged {
        action: PositionAction,
        position: PositionSnapshot,
    },
}

impl StateEvent {
    /// Flush order within a transaction; lower flushes first.
    pub(crate) fn flush_rank(&self) -> u8 {
        match self {
            Self::ModeChanged(_) => 0,
            Self::BalanceChanged { .. } => 1,
            Self::PositionChanged { .. } => 2,
        }
    }

    /// Metrics label.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ModeChanged(_) => "mode_changed",
            Self::BalanceChanged { .. } => "balance_changed",
            Self::PositionChanged { .. } => "position_changed",
        }
    }
}
