//! Raw frame to typed message normalization.
//!
//! Validates required fields per type code, carries unknown type codes
//! through as [`Message::Unknown`], rejects the protocol's two
//! documented wrong-typed responses, and tags every message with the
//! mode derived from its account identifier.

use crate::classify::{classify_account, ModeClassifier};
use crate::error::{ProtocolError, ProtocolResult, ViolationKind};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use desk_core::{
    type_codes, AccountId, BalanceUpdate, Heartbeat, LogonResponse, MarketDataUpdate, Message,
    NormalizedMessage, OrderKind, OrderSide, OrderStatus, OrderUpdate, PositionUpdate, Price, Qty,
    RawMessage, TradeAccountResponse,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// What an outstanding client request asked for. Responses are checked
/// against this to catch the platform answering with the wrong type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    OpenOrders,
    Positions,
}

/// Counters for violation-guard outcomes.
#[derive(Debug, Default)]
pub struct ViolationStats {
    rejected_count: AtomicU64,
    accepted_count: AtomicU64,
}

impl ViolationStats {
    pub fn record_rejected(&self) {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.accepted_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted_count.load(Ordering::Relaxed)
    }
}

/// Message normalizer.
///
/// Shared across the receive path and whoever issues requests; the
/// request registry is the only mutable state and is lock-free.
pub struct Normalizer {
    classifier: ModeClassifier,
    /// Outstanding request id -> what it asked for.
    requests: DashMap<i32, RequestKind>,
    stats: ViolationStats,
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            classifier: classify_account,
            requests: DashMap::new(),
            stats: ViolationStats::default(),
        }
    }

    /// Use a custom account-to-mode classifier.
    pub fn with_classifier(classifier: ModeClassifier) -> Self {
        Self {
            classifier,
            requests: DashMap::new(),
            stats: ViolationStats::default(),
        }
    }

    /// Record an outstanding request so its responses can be checked.
    pub fn register_request(&self, request_id: i32, kind: RequestKind) {
        self.requests.insert(request_id, kind);
    }

    /// Forget an outstanding request (final response seen).
    pub fn complete_request(&self, request_id: i32) {
        self.requests.remove(&request_id);
    }

    /// Violation-guard statistics.
    pub fn stats(&self) -> &ViolationStats {
        &self.stats
    }

    /// Normalize one raw frame.
    pub fn normalize(&self, raw: RawMessage) -> ProtocolResult<NormalizedMessage> {
        let message = self.parse(raw)?;
        self.check_violations(&message)?;
        self.stats.record_accepted();

        let mode = message
            .account()
            .map(|account| (self.classifier)(account.as_str()));

        Ok(NormalizedMessage {
            message,
            mode,
            received_at: Utc::now(),
        })
    }

    /// The two documented wrong-typed-response guards.
    fn check_violations(&self, message: &Message) -> ProtocolResult<()> {
        let violation = match message {
            Message::PositionUpdate(m) => m
                .request_id
                .and_then(|id| self.requests.get(&id).map(|kind| *kind))
                .filter(|kind| *kind == RequestKind::OpenOrders)
                .map(|_| ViolationKind::PositionUpdateForOpenOrders),
            Message::MarketData(m) => m
                .request_id
                .and_then(|id| self.requests.get(&id).map(|kind| *kind))
                .filter(|kind| *kind == RequestKind::Positions)
                .map(|_| ViolationKind::MarketDataForPositions),
            _ => None,
        };

        if let Some(kind) = violation {
            self.stats.record_rejected();
            warn!(%kind, "Rejecting wrong-typed response");
            return Err(ProtocolError::Violation(kind));
        }
        Ok(())
    }

    fn parse(&self, raw: RawMessage) -> ProtocolResult<Message> {
        let msg = match raw.type_code {
            type_codes::LOGON_RESPONSE => Message::LogonResponse(parse_logon_response(&raw)?),
            type_codes::HEARTBEAT => Message::Heartbeat(Heartbeat {
                current_time: get_timestamp(&raw, "CurrentDateTime"),
            }),
            type_codes::ORDER_UPDATE => Message::OrderUpdate(parse_order_update(&raw)?),
            type_codes::POSITION_UPDATE => Message::PositionUpdate(parse_position_update(&raw)?),
            type_codes::ACCOUNT_BALANCE_UPDATE => {
                Message::AccountBalanceUpdate(parse_balance_update(&raw)?)
            }
            type_codes::TRADE_ACCOUNT_RESPONSE => {
                Message::TradeAccountResponse(parse_trade_account(&raw)?)
            }
            type_codes::MARKET_DATA_UPDATE => Message::MarketData(parse_market_data(&raw)?),
            other => {
                debug!(type_code = other, "Passing through unknown message type");
                Message::Unknown {
                    type_code: other,
                    fields: raw.fields,
                }
            }
        };
        Ok(msg)
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Field extraction
// ============================================================================

fn malformed(kind: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed {
        kind,
        reason: reason.into(),
    }
}

fn get_str(raw: &RawMessage, name: &str) -> Option<String> {
    raw.field(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn require_str(raw: &RawMessage, kind: &'static str, name: &str) -> ProtocolResult<String> {
    get_str(raw, name).ok_or_else(|| malformed(kind, format!("missing {name}")))
}

fn get_i64(raw: &RawMessage, name: &str) -> Option<i64> {
    raw.field(name).and_then(Value::as_i64)
}

/// Numeric fields may arrive as JSON numbers or strings; both parse to
/// an exact `Decimal` via their textual form.
fn get_decimal(raw: &RawMessage, name: &str) -> Option<Decimal> {
    match raw.field(name)? {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn require_decimal(raw: &RawMessage, kind: &'static str, name: &str) -> ProtocolResult<Decimal> {
    get_decimal(raw, name)
        .ok_or_else(|| malformed(kind, format!("missing or non-numeric {name}")))
}

fn get_account(raw: &RawMessage) -> Option<AccountId> {
    get_str(raw, "TradeAccount").map(AccountId::new)
}

fn get_request_id(raw: &RawMessage) -> Option<i32> {
    get_i64(raw, "RequestID").and_then(|id| i32::try_from(id).ok())
}

/// Unix-millisecond timestamp field.
fn get_timestamp(raw: &RawMessage, name: &str) -> Option<DateTime<Utc>> {
    get_i64(raw, name).and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Message timestamp, falling back to receipt time when absent.
fn message_time(raw: &RawMessage) -> DateTime<Utc> {
    get_timestamp(raw, "DateTime").unwrap_or_else(Utc::now)
}

fn parse_side(raw: &RawMessage) -> Option<OrderSide> {
    match get_i64(raw, "BuySell") {
        Some(1) => Some(OrderSide::Buy),
        Some(2) => Some(OrderSide::Sell),
        _ => None,
    }
}

fn parse_kind(raw: &RawMessage) -> Option<OrderKind> {
    match get_i64(raw, "OrderType") {
        Some(1) => Some(OrderKind::Market),
        Some(2) => Some(OrderKind::Limit),
        Some(3) => Some(OrderKind::Stop),
        Some(4) => Some(OrderKind::StopLimit),
        _ => None,
    }
}

fn parse_status(raw: &RawMessage, kind: &'static str) -> ProtocolResult<OrderStatus> {
    let code = get_i64(raw, "OrderStatus")
        .ok_or_else(|| malformed(kind, "missing or non-numeric OrderStatus"))?;
    match code {
        1 => Ok(OrderStatus::New),
        2 => Ok(OrderStatus::Submitted),
        3 => Ok(OrderStatus::Open),
        4 => Ok(OrderStatus::PartiallyFilled),
        5 => Ok(OrderStatus::Filled),
        6 => Ok(OrderStatus::Canceled),
        7 => Ok(OrderStatus::Rejected),
        8 => Ok(OrderStatus::PendingCancel),
        9 => Ok(OrderStatus::PendingReplace),
        other => Err(malformed(kind, format!("unknown OrderStatus code {other}"))),
    }
}

fn parse_logon_response(raw: &RawMessage) -> ProtocolResult<LogonResponse> {
    let result =
        get_i64(raw, "Result").ok_or_else(|| malformed("logon_response", "missing Result"))?;
    Ok(LogonResponse {
        success: result == 1,
        result_text: get_str(raw, "ResultText"),
        heartbeat_interval_secs: get_i64(raw, "HeartbeatIntervalInSeconds")
            .and_then(|s| u32::try_from(s).ok()),
        server_name: get_str(raw, "ServerName"),
    })
}

fn parse_order_update(raw: &RawMessage) -> ProtocolResult<OrderUpdate> {
    const KIND: &str = "order_update";
    Ok(OrderUpdate {
        account: get_account(raw),
        symbol: require_str(raw, KIND, "Symbol")?,
        server_order_id: require_str(raw, KIND, "ServerOrderID")?,
        status: parse_status(raw, KIND)?,
        side: parse_side(raw),
        kind: parse_kind(raw),
        order_qty: get_decimal(raw, "OrderQuantity").map(Qty::new),
        price: get_decimal(raw, "Price1").map(Price::new),
        filled_qty: get_decimal(raw, "FilledQuantity").map(Qty::new),
        last_fill_qty: get_decimal(raw, "LastFillQuantity").map(Qty::new),
        last_fill_price: get_decimal(raw, "LastFillPrice").map(Price::new),
        avg_fill_price: get_decimal(raw, "AverageFillPrice").map(Price::new),
        reason: get_str(raw, "OrderUpdateReason"),
        info_text: get_str(raw, "InfoText"),
        request_id: get_request_id(raw),
        timestamp: message_time(raw),
    })
}

fn parse_position_update(raw: &RawMessage) -> ProtocolResult<PositionUpdate> {
    const KIND: &str = "position_update";
    Ok(PositionUpdate {
        account: get_account(raw),
        symbol: require_str(raw, KIND, "Symbol")?,
        qty: Qty::new(require_decimal(raw, KIND, "Quantity")?),
        avg_price: Price::new(require_decimal(raw, KIND, "AveragePrice")?),
        request_id: get_request_id(raw),
        timestamp: message_time(raw),
    })
}

fn parse_balance_update(raw: &RawMessage) -> ProtocolResult<BalanceUpdate> {
    const KIND: &str = "account_balance_update";
    Ok(BalanceUpdate {
        account: get_account(raw),
        balance: require_decimal(raw, KIND, "CashBalance")?,
        currency: get_str(raw, "AccountCurrency"),
        timestamp: message_time(raw),
    })
}

fn parse_trade_account(raw: &RawMessage) -> ProtocolResult<TradeAccountResponse> {
    const KIND: &str = "trade_account_response";
    Ok(TradeAccountResponse {
        account: AccountId::new(require_str(raw, KIND, "TradeAccount")?),
        is_last: get_i64(raw, "IsFinalMessage").unwrap_or(0) != 0,
        request_id: get_request_id(raw),
    })
}

fn parse_market_data(raw: &RawMessage) -> ProtocolResult<MarketDataUpdate> {
    const KIND: &str = "market_data";
    Ok(MarketDataUpdate {
        symbol: require_str(raw, KIND, "Symbol")?,
        price: Price::new(require_decimal(raw, KIND, "Price")?),
        qty: get_decimal(raw, "Volume").map(Qty::new),
        request_id: get_request_id(raw),
        timestamp: message_time(raw),
    })
}
