//! Message routing.
//!
//! Fans normalized messages out to the state manager, the ledger feed
//! and external order subscribers. Consumers filter by mode here: a
//! message whose derived mode does not match the currently tracked mode
//! is discarded, except when the tag is absent (back-compat accept).
//! Malformed and violating messages are dropped with a counter; the
//! stream continues.

use desk_core::{Message, NormalizedMessage, OrderUpdate, RawMessage};
use desk_ledger::{build_ledger, OrderRecord};
use desk_protocol::{Normalizer, ProtocolError};
use desk_state::{mode_filter, StateManager};
use desk_telemetry::metrics::{GATEWAY_DROPPED_TOTAL, GATEWAY_MESSAGES_TOTAL};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Fan-out point between the transport and the stateful consumers.
pub struct MessageRouter {
    normalizer: Arc<Normalizer>,
    state: Arc<StateManager>,
    /// Replayable order-update log feeding the ledger builder.
    ledger_log: Mutex<Vec<OrderUpdate>>,
    /// External subscribers notified with the rebuilt record whenever
    /// an order reaches a terminal status.
    order_subscribers: Mutex<Vec<mpsc::UnboundedSender<OrderRecord>>>,
}

impl MessageRouter {
    pub fn new(normalizer: Arc<Normalizer>, state: Arc<StateManager>) -> Self {
        Self {
            normalizer,
            state,
            ledger_log: Mutex::new(Vec::new()),
            order_subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to terminal order records.
    pub fn subscribe_orders(&self) -> mpsc::UnboundedReceiver<OrderRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.order_subscribers.lock().push(tx);
        rx
    }

    /// The accumulated order-update log, for replay and export.
    pub fn order_updates(&self) -> Vec<OrderUpdate> {
        self.ledger_log.lock().clone()
    }

    /// Normalize and dispatch one raw frame.
    pub fn handle_raw(&self, raw: RawMessage) {
        match self.normalizer.normalize(raw) {
            Ok(normalized) => self.dispatch(normalized),
            Err(ProtocolError::Malformed { kind, reason }) => {
                warn!(kind, %reason, "Dropping malformed message");
                GATEWAY_DROPPED_TOTAL.with_label_values(&["malformed"]).inc();
            }
            Err(ProtocolError::Violation(kind)) => {
                warn!(%kind, "Dropping protocol violation");
                GATEWAY_DROPPED_TOTAL.with_label_values(&[kind.label()]).inc();
            }
        }
    }

    fn dispatch(&self, normalized: NormalizedMessage) {
        GATEWAY_MESSAGES_TOTAL
            .with_label_values(&[normalized.message.kind_name()])
            .inc();

        let tracked = self.state.current_mode();
        let mode = normalized.mode;

        match normalized.message {
            Message::Heartbeat(_) => trace!("Heartbeat"),
            Message::LogonResponse(response) => {
                debug!(?response, "Logon response outside handshake");
            }
            Message::TradeAccountResponse(response) => {
                info!(
                    account = %response.account,
                    mode = ?mode,
                    is_last = response.is_last,
                    "Trade account"
                );
                if response.is_last {
                    if let Some(id) = response.request_id {
                        self.normalizer.complete_request(id);
                    }
                }
            }
            Message::AccountBalanceUpdate(update) => {
                if !mode_filter::accepts(mode, tracked) {
                    debug!(?mode, %tracked, "Discarding balance update for other mode");
                    GATEWAY_DROPPED_TOTAL
                        .with_label_values(&["mode_filtered"])
                        .inc();
                    return;
                }
                let target = mode.unwrap_or(tracked);
                self.state.apply_balance_update(target, update.balance);
            }
            Message::PositionUpdate(update) => {
                if !mode_filter::accepts(mode, tracked) {
                    debug!(?mode, %tracked, "Discarding position update for other mode");
                    GATEWAY_DROPPED_TOTAL
                        .with_label_values(&["mode_filtered"])
                        .inc();
                    return;
                }
                let target = mode.unwrap_or(tracked);
                if let Err(e) =
                    self.state
                        .sync_position(target, &update.symbol, update.qty, update.avg_price)
                {
                    warn!(?e, symbol = %update.symbol, "Position sync failed");
                }
            }
            Message::OrderUpdate(update) => {
                if !mode_filter::accepts(mode, tracked) {
                    debug!(?mode, %tracked, "Discarding order update for other mode");
                    GATEWAY_DROPPED_TOTAL
                        .with_label_values(&["mode_filtered"])
                        .inc();
                    return;
                }
                self.on_order_update(update);
            }
            Message::MarketData(update) => {
                trace!(symbol = %update.symbol, price = %update.price, "Market data");
            }
            Message::Unknown { type_code, .. } => {
                debug!(type_code, "Ignoring unknown message type");
            }
        }
    }

    fn on_order_update(&self, update: OrderUpdate) {
        let terminal = update.status.is_terminal();
        let order_id = update.server_order_id.clone();

        let record = {
            let mut log = self.ledger_log.lock();
            log.push(update);
            if terminal {
                // Rebuild just this order's record from its updates.
                let updates: Vec<OrderUpdate> = log
                    .iter()
                    .filter(|u| u.server_order_id == order_id)
                    .cloned()
                    .collect();
                build_ledger(&updates).into_iter().next()
            } else {
                None
            }
        };

        if let Some(record) = record {
            debug!(
                order_id = %record.server_order_id,
                status = %record.status,
                filled = %record.filled_qty,
                "Order reached terminal status"
            );
            self.order_subscribers
                .lock()
                .retain(|tx| tx.send(record.clone()).is_ok());
        }
    }
}
