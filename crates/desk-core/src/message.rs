//! Platform message model.
//!
//! `RawMessage` is a frame as it comes off the wire: a numeric type code
//! plus an opaque field map. The normalizer turns it into `Message`, a
//! tagged variant with typed payloads, and attaches the derived trading
//! mode to produce a `NormalizedMessage`.

use crate::decimal::{Price, Qty};
use crate::mode::{AccountId, TradingMode};
use crate::order::{OrderKind, OrderSide, OrderStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire type codes for the platform protocol.
///
/// The codes are stable protocol constants; unknown codes are carried
/// through as [`Message::Unknown`] rather than rejected.
pub mod type_codes {
    pub const LOGON_REQUEST: u16 = 1;
    pub const LOGON_RESPONSE: u16 = 2;
    pub const HEARTBEAT: u16 = 3;
    pub const LOGOFF: u16 = 5;
    pub const MARKET_DATA_UPDATE: u16 = 107;
    pub const OPEN_ORDERS_REQUEST: u16 = 300;
    pub const ORDER_UPDATE: u16 = 301;
    pub const CURRENT_POSITIONS_REQUEST: u16 = 305;
    pub const POSITION_UPDATE: u16 = 306;
    pub const TRADE_ACCOUNTS_REQUEST: u16 = 400;
    pub const TRADE_ACCOUNT_RESPONSE: u16 = 401;
    pub const ACCOUNT_BALANCE_UPDATE: u16 = 600;
}

/// An undecoded protocol frame: type code plus field map.
///
/// The wire framing that produced it is a transport concern; everything
/// above the transport sees only this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Numeric message type code.
    pub type_code: u16,
    /// Message body as a JSON object.
    pub fields: Value,
}

impl RawMessage {
    pub fn new(type_code: u16, fields: Value) -> Self {
        Self { type_code, fields }
    }

    /// Look up a top-level field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Logon handshake response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogonResponse {
    /// Non-zero means the logon was accepted.
    pub success: bool,
    pub result_text: Option<String>,
    /// Heartbeat interval negotiated by the server, in seconds.
    pub heartbeat_interval_secs: Option<u32>,
    pub server_name: Option<String>,
}

/// Unsolicited heartbeat from the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Server clock at send time, when transmitted.
    pub current_time: Option<DateTime<Utc>>,
}

/// A single order lifecycle update.
///
/// Quantities are cumulative where the name says so; `last_fill_*`
/// describe only the increment carried by this update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub account: Option<AccountId>,
    pub symbol: String,
    /// Server-assigned order id; groups updates belonging to one order.
    pub server_order_id: String,
    pub status: OrderStatus,
    pub side: Option<OrderSide>,
    pub kind: Option<OrderKind>,
    pub order_qty: Option<Qty>,
    pub price: Option<Price>,
    /// Cumulative filled quantity reported by this update.
    pub filled_qty: Option<Qty>,
    pub last_fill_qty: Option<Qty>,
    pub last_fill_price: Option<Price>,
    pub avg_fill_price: Option<Price>,
    /// Status-change reason supplied by the server.
    pub reason: Option<String>,
    pub info_text: Option<String>,
    /// Correlates the update to an outstanding client request.
    pub request_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

/// Net position report for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub account: Option<AccountId>,
    pub symbol: String,
    /// Signed net quantity; zero means flat.
    pub qty: Qty,
    pub avg_price: Price,
    pub request_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

/// Account balance report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub account: Option<AccountId>,
    pub balance: rust_decimal::Decimal,
    pub currency: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One entry of a trade account enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeAccountResponse {
    pub account: AccountId,
    /// True on the final entry of the enumeration.
    pub is_last: bool,
    pub request_id: Option<i32>,
}

/// Trade print / market data tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataUpdate {
    pub symbol: String,
    pub price: Price,
    pub qty: Option<Qty>,
    pub request_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

/// Tagged variant over the protocol's message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    LogonResponse(LogonResponse),
    Heartbeat(Heartbeat),
    OrderUpdate(OrderUpdate),
    PositionUpdate(PositionUpdate),
    AccountBalanceUpdate(BalanceUpdate),
    TradeAccountResponse(TradeAccountResponse),
    MarketData(MarketDataUpdate),
    /// A recognized frame with an unrecognized type code. Carried
    /// through so protocol additions do not break the pipeline.
    Unknown { type_code: u16, fields: Value },
}

impl Message {
    /// The account identifier carried by the payload, if any.
    pub fn account(&self) -> Option<&AccountId> {
        match self {
            Self::OrderUpdate(m) => m.account.as_ref(),
            Self::PositionUpdate(m) => m.account.as_ref(),
            Self::AccountBalanceUpdate(m) => m.account.as_ref(),
            Self::TradeAccountResponse(m) => Some(&m.account),
            _ => None,
        }
    }

    /// The client request id the payload correlates to, if any.
    pub fn request_id(&self) -> Option<i32> {
        match self {
            Self::OrderUpdate(m) => m.request_id,
            Self::PositionUpdate(m) => m.request_id,
            Self::TradeAccountResponse(m) => m.request_id,
            Self::MarketData(m) => m.request_id,
            _ => None,
        }
    }

    /// Short name for logging and metrics labels.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::LogonResponse(_) => "logon_response",
            Self::Heartbeat(_) => "heartbeat",
            Self::OrderUpdate(_) => "order_update",
            Self::PositionUpdate(_) => "position_update",
            Self::AccountBalanceUpdate(_) => "account_balance_update",
            Self::TradeAccountResponse(_) => "trade_account_response",
            Self::MarketData(_) => "market_data",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// A message with its derived trading-mode tag attached.
///
/// `mode` is `None` when the payload carries no account identifier;
/// such messages are accepted by consumers tracking any mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub message: Message,
    pub mode: Option<TradingMode>,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_message_field_lookup() {
        let raw = RawMessage::new(
            type_codes::ORDER_UPDATE,
            json!({"Symbol": "ESZ5", "ServerOrderID": "42"}),
        );
        assert_eq!(raw.field("Symbol").and_then(Value::as_str), Some("ESZ5"));
        assert!(raw.field("Missing").is_none());
    }

    #[test]
    fn test_message_account_extraction() {
        let msg = Message::AccountBalanceUpdate(BalanceUpdate {
            account: Some(AccountId::new("Sim1")),
            balance: rust_decimal::Decimal::new(100_000, 2),
            currency: None,
            timestamp: Utc::now(),
        });
        assert_eq!(msg.account().map(AccountId::as_str), Some("Sim1"));
        assert_eq!(msg.kind_name(), "account_balance_update");
    }
}
