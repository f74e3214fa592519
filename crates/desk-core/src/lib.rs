//! Core domain types for the desk gateway.
//!
//! This crate provides fundamental types used throughout the gateway:
//! - `TradingMode`: SIM/LIVE/DEBUG data segregation
//! - `Price`, `Qty`: precision-safe numeric types
//! - `Message`: the tagged variant over the platform's message kinds
//! - `RawMessage`: an undecoded type code + field map as it comes off the wire

pub mod decimal;
pub mod error;
pub mod message;
pub mod mode;
pub mod order;

pub use decimal::{Price, Qty};
pub use error::{CoreError, Result};
pub use message::{
    type_codes, BalanceUpdate, Heartbeat, LogonResponse, MarketDataUpdate, Message,
    NormalizedMessage, OrderUpdate, PositionUpdate, RawMessage, TradeAccountResponse,
};
pub use mode::{AccountId, TradingMode};
pub use order::{OrderKind, OrderSide, OrderStatus};
