//! The state manager.
//!
//! Explicitly constructed and passed by reference; there is no ambient
//! global. All writes go through [`StateManager::transaction`] (or the
//! one-shot wrappers), which holds the internal lock for the duration
//! of the transaction, never blocks on I/O while holding it, and
//! flushes buffered notifications in the fixed order mode, then
//! balance, then position once the transaction commits.

use crate::error::{StateError, StateResult};
use crate::events::{PositionAction, PositionSnapshot, StateEvent};
use chrono::{DateTime, Utc};
use desk_core::{OrderSide, Price, Qty, TradingMode};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::debug;

/// What a closed position looked like.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPositionSummary {
    pub symbol: String,
    pub qty: Qty,
    pub avg_entry_price: Price,
    pub side: OrderSide,
    pub mode: TradingMode,
    pub recovered_without_entry_time: bool,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// A direct position-field write request.
///
/// Exists only so the legacy "just set the fields" path has somewhere
/// to land: [`StateManager::patch_position_fields`] rejects it
/// unconditionally.
#[derive(Debug, Clone, Default)]
pub struct PositionPatch {
    pub symbol: Option<String>,
    pub qty: Option<Qty>,
    pub avg_price: Option<Price>,
}

struct StateInner {
    mode: TradingMode,
    sim_balance: Decimal,
    live_balance: Decimal,
    /// Start-of-accounting-period baseline for the SIM balance.
    sim_period_baseline: Decimal,
    position: Option<PositionSnapshot>,
    subscribers: Vec<mpsc::UnboundedSender<StateEvent>>,
}

/// Mode, balance and position state machine.
pub struct StateManager {
    inner: Mutex<StateInner>,
}

impl StateManager {
    pub fn new(initial_mode: TradingMode, sim_start_balance: Decimal) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                mode: initial_mode,
                sim_balance: sim_start_balance,
                live_balance: Decimal::ZERO,
                sim_period_baseline: sim_start_balance,
                position: None,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Subscribe to state change notifications.
    ///
    /// Events arrive in the documented mode -> balance -> position
    /// order per transaction. Dropped receivers are pruned lazily.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    /// Run `f` as one transaction.
    ///
    /// Every mutation inside `f` is applied atomically with respect to
    /// other callers, and the notifications it produced are flushed in
    /// flush-rank order only once `f` returns -- never interleaved,
    /// regardless of the mutation order inside the transaction.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut StateTxn<'_>) -> R) -> R {
        let mut inner = self.inner.lock();
        let mut events = Vec::new();

        let result = {
            let mut txn = StateTxn {
                inner: &mut *inner,
                events: &mut events,
            };
            f(&mut txn)
        };

        // Stable sort: relative order within a rank is emission order.
        events.sort_by_key(|event| event.flush_rank());
        inner
            .subscribers
            .retain(|tx| events.iter().all(|event| tx.send(event.clone()).is_ok()));

        result
    }

    // === One-shot wrappers ===

    /// Change the trading mode. Refused (returns `false`, state
    /// unchanged) while a position is open in a different mode.
    pub fn request_mode_change(&self, mode: TradingMode) -> bool {
        self.transaction(|txn| txn.request_mode_change(mode))
    }

    /// Overwrite the stored balance for a mode.
    pub fn apply_balance_update(&self, mode: TradingMode, balance: Decimal) {
        self.transaction(|txn| txn.apply_balance_update(mode, balance));
    }

    /// Administrative balance reset (e.g. the periodic SIM reset).
    pub fn reset_mode_balance(&self, mode: TradingMode, value: Decimal) {
        self.transaction(|txn| txn.reset_mode_balance(mode, value));
    }

    /// Open a position from a live order fill.
    pub fn open_position(
        &self,
        mode: TradingMode,
        symbol: &str,
        qty: Qty,
        price: Price,
        side: OrderSide,
    ) -> StateResult<()> {
        self.transaction(|txn| txn.open_position(mode, symbol, qty, price, side))
    }

    /// Close the open position.
    pub fn close_position(&self) -> StateResult<ClosedPositionSummary> {
        self.transaction(|txn| txn.close_position())
    }

    /// Reconcile the position against a platform position report.
    pub fn sync_position(
        &self,
        mode: TradingMode,
        symbol: &str,
        net_qty: Qty,
        avg_price: Price,
    ) -> StateResult<()> {
        self.transaction(|txn| txn.sync_position(mode, symbol, net_qty, avg_price))
    }

    /// Direct position-field writes are the bug class this design
    /// exists to prevent; this always fails.
    pub fn patch_position_fields(&self, _patch: PositionPatch) -> StateResult<()> {
        Err(StateError::UnsupportedOperation)
    }

    // === Read access ===

    pub fn current_mode(&self) -> TradingMode {
        self.inner.lock().mode
    }

    /// Stored balance for a mode; `None` for DEBUG, which carries none.
    pub fn balance(&self, mode: TradingMode) -> Option<Decimal> {
        let inner = self.inner.lock();
        match mode {
            TradingMode::Sim => Some(inner.sim_balance),
            TradingMode::Live => Some(inner.live_balance),
            TradingMode::Debug => None,
        }
    }

    /// Start-of-period baseline for the SIM balance.
    pub fn sim_period_baseline(&self) -> Decimal {
        self.inner.lock().sim_period_baseline
    }

    pub fn position(&self) -> Option<PositionSnapshot> {
        self.inner.lock().position.clone()
    }
}

/// Mutation surface available inside a transaction.
pub struct StateTxn<'a> {
    inner: &'a mut StateInner,
    events: &'a mut Vec<StateEvent>,
}

impl StateTxn<'_> {
    pub fn current_mode(&self) -> TradingMode {
        self.inner.mode
    }

    /// See [`StateManager::request_mode_change`].
    pub fn request_mode_change(&mut self, mode: TradingMode) -> bool {
        if let Some(position) = &self.inner.position {
            if position.mode != mode {
                debug!(
                    current = %self.inner.mode,
                    requested = %mode,
                    position_mode = %position.mode,
                    "Mode change blocked by open position"
                );
                return false;
            }
        }
        if self.inner.mode != mode {
            self.inner.mode = mode;
            self.events.push(StateEvent::ModeChanged(mode));
        }
        true
    }

    /// See [`StateManager::apply_balance_update`].
    pub fn apply_balance_update(&mut self, mode: TradingMode, balance: Decimal) {
        match mode {
            TradingMode::Sim => self.inner.sim_balance = balance,
            TradingMode::Live => self.inner.live_balance = balance,
            TradingMode::Debug => {
                debug!("Dropping balance update for DEBUG mode");
                return;
            }
        }
        self.events.push(StateEvent::BalanceChanged { mode, balance });
    }

    /// See [`StateManager::reset_mode_balance`].
    pub fn reset_mode_balance(&mut self, mode: TradingMode, value: Decimal) {
        if mode == TradingMode::Sim {
            self.inner.sim_period_baseline = value;
        }
        self.apply_balance_update(mode, value);
    }

    /// See [`StateManager::open_position`].
    pub fn open_position(
        &mut self,
        mode: TradingMode,
        symbol: &str,
        qty: Qty,
        price: Price,
        side: OrderSide,
    ) -> StateResult<()> {
        if self.inner.position.is_some() {
            return Err(StateError::PositionAlreadyOpen);
        }
        if !qty.is_positive() {
            return Err(StateError::InvalidQuantity(qty));
        }

        let position = PositionSnapshot {
            symbol: symbol.to_string(),
            qty,
            avg_price: price,
            side,
            mode,
            recovered_without_entry_time: false,
            opened_at: Utc::now(),
        };
        self.inner.position = Some(position.clone());
        self.events.push(StateEvent::PositionChanged {
            action: PositionAction::Open,
            position,
        });
        Ok(())
    }

    /// See [`StateManager::close_position`].
    pub fn close_position(&mut self) -> StateResult<ClosedPositionSummary> {
        let position = self
            .inner
            .position
            .take()
            .ok_or(StateError::NoOpenPosition)?;

        let summary = ClosedPositionSummary {
            symbol: position.symbol.clone(),
            qty: position.qty,
            avg_entry_price: position.avg_price,
            side: position.side,
            mode: position.mode,
            recovered_without_entry_time: position.recovered_without_entry_time,
            opened_at: position.opened_at,
            closed_at: Utc::now(),
        };
        self.events.push(StateEvent::PositionChanged {
            action: PositionAction::Close,
            position,
        });
        Ok(summary)
    }

    /// Reconcile against a platform position report.
    ///
    /// Zero quantity closes any open position. A non-zero quantity with
    /// no position open records one discovered via reconciliation, with
    /// `recovered_without_entry_time` set; with a position open, its
    /// fields are brought in line with the report.
    pub fn sync_position(
        &mut self,
        mode: TradingMode,
        symbol: &str,
        net_qty: Qty,
        avg_price: Price,
    ) -> StateResult<()> {
        if net_qty.is_zero() {
            if self.inner.position.is_some() {
                self.close_position()?;
            }
            return Ok(());
        }

        let side = if net_qty.is_positive() {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let qty = net_qty.abs();

        let position = match self.inner.position.as_mut() {
            Some(position) => {
                position.symbol = symbol.to_string();
                position.qty = qty;
                position.avg_price = avg_price;
                position.side = side;
                position.mode = mode;
                position.clone()
            }
            None => {
                let position = PositionSnapshot {
                    symbol: symbol.to_string(),
                    qty,
                    avg_price,
                    side,
                    mode,
                    recovered_without_entry_time: true,
                    opened_at: Utc::now(),
                };
                self.inner.position = Some(position.clone());
                position
            }
        };

        self.events.push(StateEvent::PositionChanged {
            action: PositionAction::Open,
            position,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn manager() -> StateManager {
        StateManager::new(TradingMode::Sim, dec!(100000))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StateEvent>) -> Vec<StateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_mode_change_applied_when_flat() {
        let state = manager();
        assert!(state.request_mode_change(TradingMode::Live));
        assert_eq!(state.current_mode(), TradingMode::Live);
    }

    #[test]
    fn test_mode_change_blocked_by_open_position_in_other_mode() {
        let state = manager();
        state
            .open_position(
                TradingMode::Sim,
                "ESZ5",
                Qty::new(dec!(1)),
                Price::new(dec!(5000)),
                OrderSide::Buy,
            )
            .unwrap();

        assert!(!state.request_mode_change(TradingMode::Live));
        // State unchanged.
        assert_eq!(state.current_mode(), TradingMode::Sim);
        assert!(state.position().is_some());

        // Same-mode request is trivially accepted.
        assert!(state.request_mode_change(TradingMode::Sim));
    }

    #[test]
    fn test_balances_are_segregated_by_mode() {
        let state = manager();
        state.apply_balance_update(TradingMode::Sim, dec!(99000));
        state.apply_balance_update(TradingMode::Live, dec!(5000));

        assert_eq!(state.balance(TradingMode::Sim), Some(dec!(99000)));
        assert_eq!(state.balance(TradingMode::Live), Some(dec!(5000)));
        assert_eq!(state.balance(TradingMode::Debug), None);
    }

    #[test]
    fn test_sim_reset_rebases_period_baseline() {
        let state = manager();
        state.apply_balance_update(TradingMode::Sim, dec!(87000));
        assert_eq!(state.sim_period_baseline(), dec!(100000));

        state.reset_mode_balance(TradingMode::Sim, dec!(100000));
        assert_eq!(state.balance(TradingMode::Sim), Some(dec!(100000)));
        assert_eq!(state.sim_period_baseline(), dec!(100000));
    }

    #[test]
    fn test_position_lifecycle() {
        let state = manager();
        let mut rx = state.subscribe();

        state
            .open_position(
                TradingMode::Sim,
                "ESZ5",
                Qty::new(dec!(2)),
                Price::new(dec!(5000.25)),
                OrderSide::Buy,
            )
            .unwrap();

        // Second open fails loudly.
        assert!(matches!(
            state.open_position(
                TradingMode::Sim,
                "NQZ5",
                Qty::new(dec!(1)),
                Price::new(dec!(18000)),
                OrderSide::Buy,
            ),
            Err(StateError::PositionAlreadyOpen)
        ));

        let summary = state.close_position().unwrap();
        assert_eq!(summary.symbol, "ESZ5");
        assert_eq!(summary.qty, Qty::new(dec!(2)));
        assert_eq!(summary.mode, TradingMode::Sim);
        assert!(state.position().is_none());

        assert!(matches!(
            state.close_position(),
            Err(StateError::NoOpenPosition)
        ));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            StateEvent::PositionChanged {
                action: PositionAction::Open,
                ..
            }
        ));
        assert!(matches!(
            events[1],
            StateEvent::PositionChanged {
                action: PositionAction::Close,
                ..
            }
        ));
    }

    #[test]
    fn test_zero_qty_open_rejected() {
        let state = manager();
        assert!(matches!(
            state.open_position(
                TradingMode::Sim,
                "ESZ5",
                Qty::ZERO,
                Price::new(dec!(5000)),
                OrderSide::Buy,
            ),
            Err(StateError::InvalidQuantity(_))
        ));
    }

    #[test]
    fn test_sync_position_sets_recovered_flag() {
        let state = manager();
        state
            .sync_position(
                TradingMode::Sim,
                "ESZ5",
                Qty::new(dec!(-3)),
                Price::new(dec!(5000)),
            )
            .unwrap();

        let position = state.position().unwrap();
        assert!(position.recovered_without_entry_time);
        assert_eq!(position.side, OrderSide::Sell);
        assert_eq!(position.qty, Qty::new(dec!(3)));
    }

    #[test]
    fn test_sync_position_zero_closes() {
        let state = manager();
        state
            .sync_position(
                TradingMode::Sim,
                "ESZ5",
                Qty::new(dec!(1)),
                Price::new(dec!(5000)),
            )
            .unwrap();
        assert!(state.position().is_some());

        state
            .sync_position(TradingMode::Sim, "ESZ5", Qty::ZERO, Price::ZERO)
            .unwrap();
        assert!(state.position().is_none());
    }

    #[test]
    fn test_patch_position_fields_always_fails() {
        let state = manager();
        let result = state.patch_position_fields(PositionPatch {
            qty: Some(Qty::new(dec!(5))),
            ..Default::default()
        });
        assert!(matches!(result, Err(StateError::UnsupportedOperation)));
    }

    #[test]
    fn test_notification_order_fixed_within_transaction() {
        let state = manager();
        state
            .open_position(
                TradingMode::Sim,
                "ESZ5",
                Qty::new(dec!(1)),
                Price::new(dec!(5000)),
                OrderSide::Buy,
            )
            .unwrap();

        let mut rx = state.subscribe();

        // Mutate in the WORST order: position first, balance second,
        // mode last. The flush must still be mode, balance, position.
        state.transaction(|txn| {
            txn.close_position().unwrap();
            txn.apply_balance_update(TradingMode::Live, dec!(42000));
            assert!(txn.request_mode_change(TradingMode::Live));
        });

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StateEvent::ModeChanged(TradingMode::Live)));
        assert!(matches!(events[1], StateEvent::BalanceChanged { .. }));
        assert!(matches!(events[2], StateEvent::PositionChanged { .. }));
    }

    /// Tiny deterministic PRNG so the randomized ordering test does not
    /// need an external crate.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    #[test]
    fn test_notification_order_across_randomized_transactions() {
        let state = manager();
        let mut rx = state.subscribe();
        let mut rng = XorShift(0x9E3779B97F4A7C15);

        let mut mode = TradingMode::Sim;
        for round in 0..150 {
            let next_mode = if mode == TradingMode::Sim {
                TradingMode::Live
            } else {
                TradingMode::Sim
            };
            let balance = Decimal::from(1000 + (rng.next() % 90000));
            // Where to slot the balance update among the ordered steps
            // (close -> mode change -> open) varies per round.
            let balance_slot = rng.next() % 4;

            state.transaction(|txn| {
                let mut slot = 0;
                let maybe_balance = |txn: &mut StateTxn<'_>, slot: u64| {
                    if slot == balance_slot {
                        txn.apply_balance_update(next_mode, balance);
                    }
                };

                maybe_balance(txn, slot);
                slot += 1;
                if round > 0 {
                    txn.close_position().unwrap();
                }
                maybe_balance(txn, slot);
                slot += 1;
                assert!(txn.request_mode_change(next_mode));
                maybe_balance(txn, slot);
                slot += 1;
                txn.open_position(
                    next_mode,
                    "ESZ5",
                    Qty::new(dec!(1)),
                    Price::new(dec!(5000)),
                    OrderSide::Buy,
                )
                .unwrap();
                maybe_balance(txn, slot);
            });

            let events = drain(&mut rx);
            // Every transaction must flush with non-decreasing rank:
            // mode (0), balance (1), position (2).
            let ranks: Vec<u8> = events
                .iter()
                .map(|event| match event {
                    StateEvent::ModeChanged(_) => 0,
                    StateEvent::BalanceChanged { .. } => 1,
                    StateEvent::PositionChanged { .. } => 2,
                })
                .collect();
            let mut sorted = ranks.clone();
            sorted.sort_unstable();
            assert_eq!(ranks, sorted, "round {round}: order was {events:?}");

            // And the expected events are all present.
            assert!(matches!(events[0], StateEvent::ModeChanged(_)));
            assert_eq!(
                events
                    .iter()
                    .filter(|e| matches!(e, StateEvent::BalanceChanged { .. }))
                    .count(),
                1
            );

            mode = next_mode;
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let state = manager();
        let rx = state.subscribe();
        drop(rx);

        // Must not fail or wedge with a dead subscriber in the list.
        state.apply_balance_update(TradingMode::Sim, dec!(1));

        let mut rx2 = state.subscribe();
        state.apply_balance_update(TradingMode::Sim, dec!(2));
        assert_eq!(drain(&mut rx2).len(), 1);
    }
}
