//! Ledger construction from order-update streams.
//!
//! Grouping key is the server-assigned order id. Terminal status is
//! resolved by rank (see [`desk_core::OrderStatus::rank`]), ties broken
//! by latest timestamp, then by input order, which keeps re-runs on the
//! same input byte-identical.

use chrono::{DateTime, Duration, Utc};
use desk_core::{AccountId, OrderKind, OrderSide, OrderStatus, OrderUpdate, Price, Qty};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// How a position-closing fill exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitKind {
    Stop,
    Limit,
    Market,
}

impl ExitKind {
    fn from_order_kind(kind: OrderKind) -> Self {
        match kind {
            OrderKind::Stop | OrderKind::StopLimit => Self::Stop,
            OrderKind::Limit => Self::Limit,
            OrderKind::Market => Self::Market,
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Limit => write!(f, "limit"),
            Self::Market => write!(f, "market"),
        }
    }
}

/// The synthesized record for one server order id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRecord {
    pub server_order_id: String,
    pub account: Option<AccountId>,
    pub symbol: String,
    pub side: Option<OrderSide>,
    pub kind: Option<OrderKind>,
    pub requested_qty: Option<Qty>,
    pub requested_price: Option<Price>,
    /// Cumulative filled quantity.
    pub filled_qty: Qty,
    /// Volume-weighted average fill price.
    pub avg_fill_price: Option<Price>,
    pub status: OrderStatus,
    pub reason: Option<String>,
    pub info_text: Option<String>,
    pub first_update: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// Exit classification, present when this order's fill closed a
    /// position.
    pub exit_kind: Option<ExitKind>,
    /// Highest trade price observed while the position tied to this
    /// order was open.
    pub high_while_open: Option<Price>,
    /// Lowest trade price observed while the position tied to this
    /// order was open.
    pub low_while_open: Option<Price>,
}

impl OrderRecord {
    /// Time between the first and last update of the order.
    pub fn duration(&self) -> Duration {
        self.last_update - self.first_update
    }
}

/// One fill, flattened out of the update stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillRow {
    pub server_order_id: String,
    pub account: Option<AccountId>,
    pub symbol: String,
    pub side: Option<OrderSide>,
    pub qty: Qty,
    pub price: Price,
    pub timestamp: DateTime<Utc>,
}

/// Group update indices by server order id, in order of first
/// appearance.
fn group_by_order(updates: &[OrderUpdate]) -> Vec<(String, Vec<usize>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, update) in updates.iter().enumerate() {
        let entry = groups.entry(&update.server_order_id).or_insert_with(|| {
            order.push(update.server_order_id.clone());
            Vec::new()
        });
        entry.push(i);
    }
    order
        .into_iter()
        .map(|id| {
            let indices = groups.remove(id.as_str()).unwrap_or_default();
            (id, indices)
        })
        .collect()
}

/// Extract every fill from the stream, chronologically sorted.
///
/// An update bears a fill when it carries explicit `last_fill_*`
/// fields, or when its cumulative filled quantity increased over the
/// previous update of the same order (the increment is then priced by
/// the best available price field).
pub fn fill_stream(updates: &[OrderUpdate]) -> Vec<FillRow> {
    let mut prev_cum: HashMap<&str, Decimal> = HashMap::new();
    let mut last_side: HashMap<&str, OrderSide> = HashMap::new();
    let mut fills = Vec::new();

    for update in updates {
        let id = update.server_order_id.as_str();
        if let Some(side) = update.side {
            last_side.insert(id, side);
        }

        let explicit = match (update.last_fill_qty, update.last_fill_price) {
            (Some(qty), Some(price)) if qty.is_positive() => Some((qty, price)),
            _ => None,
        };

        let fill = explicit.or_else(|| {
            let cum = update.filled_qty?.inner();
            let prev = prev_cum.get(id).copied().unwrap_or(Decimal::ZERO);
            let delta = cum - prev;
            if delta <= Decimal::ZERO {
                return None;
            }
            let price = update
                .last_fill_price
                .or(update.avg_fill_price)
                .or(update.price)?;
            Some((Qty::new(delta), price))
        });

        if let Some(cum) = update.filled_qty {
            let prev = prev_cum.entry(id).or_insert(Decimal::ZERO);
            if cum.inner() > *prev {
                *prev = cum.inner();
            }
        }

        if let Some((qty, price)) = fill {
            fills.push(FillRow {
                server_order_id: update.server_order_id.clone(),
                account: update.account.clone(),
                symbol: update.symbol.clone(),
                side: update.side.or_else(|| last_side.get(id).copied()),
                qty,
                price,
                timestamp: update.timestamp,
            });
        }
    }

    // Stable sort: timestamp, then order id; equal keys keep input order.
    fills.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.server_order_id.cmp(&b.server_order_id))
    });
    fills
}

/// Per-closing-order exit data from replaying fills against a running
/// position. The window for high/low runs from the fill that opened the
/// position to the fill that brought it back to flat.
fn closing_windows(fills: &[FillRow]) -> HashMap<String, (Price, Price)> {
    #[derive(Default)]
    struct Running {
        net: Decimal,
        high: Option<Price>,
        low: Option<Price>,
    }

    let mut positions: HashMap<(Option<AccountId>, String), Running> = HashMap::new();
    let mut closers = HashMap::new();

    for fill in fills {
        let Some(side) = fill.side else { continue };
        let key = (fill.account.clone(), fill.symbol.clone());
        let running = positions.entry(key.clone()).or_default();

        let was_flat = running.net.is_zero();
        running.net += Decimal::from(side.sign()) * fill.qty.inner();

        if was_flat {
            running.high = Some(fill.price);
            running.low = Some(fill.price);
        } else {
            running.high = Some(running.high.map_or(fill.price, |h| h.max(fill.price)));
            running.low = Some(running.low.map_or(fill.price, |l| l.min(fill.price)));
        }

        if !was_flat && running.net.is_zero() {
            if let (Some(high), Some(low)) = (running.high, running.low) {
                closers.insert(fill.server_order_id.clone(), (high, low));
            }
            positions.remove(&key);
        }
    }

    closers
}

/// Build the terminal record per order.
pub fn build_ledger(updates: &[OrderUpdate]) -> Vec<OrderRecord> {
    let fills = fill_stream(updates);
    let closers = closing_windows(&fills);

    // Per-order fill totals for VWAP.
    let mut fill_totals: HashMap<String, (Decimal, Decimal)> = HashMap::new();
    for fill in &fills {
        let entry = fill_totals
            .entry(fill.server_order_id.clone())
            .or_insert((Decimal::ZERO, Decimal::ZERO));
        entry.0 += fill.qty.inner();
        entry.1 += fill.qty.inner() * fill.price.inner();
    }

    let mut records: Vec<OrderRecord> = group_by_order(updates)
        .into_iter()
        .map(|(id, indices)| synthesize(updates, &id, &indices, &fill_totals, &closers))
        .collect();

    records.sort_by(|a, b| {
        a.first_update
            .cmp(&b.first_update)
            .then_with(|| a.server_order_id.cmp(&b.server_order_id))
    });
    records
}

/// Latest-snapshot view: the most recently timestamped record per
/// order, irrespective of terminal rank. Answers "what does the broker
/// currently think" rather than "what finally happened".
pub fn snapshot(updates: &[OrderUpdate]) -> Vec<OrderRecord> {
    let mut records: Vec<OrderRecord> = group_by_order(updates)
        .into_iter()
        .map(|(id, indices)| {
            // Latest timestamp wins; input order breaks ties.
            let latest = indices
                .iter()
                .copied()
                .max_by(|&a, &b| {
                    updates[a]
                        .timestamp
                        .cmp(&updates[b].timestamp)
                        .then_with(|| a.cmp(&b))
                })
                .expect("group is never empty");
            let update = &updates[latest];

            OrderRecord {
                server_order_id: id,
                account: update.account.clone(),
                symbol: update.symbol.clone(),
                side: update.side,
                kind: update.kind,
                requested_qty: update.order_qty,
                requested_price: update.price,
                filled_qty: update.filled_qty.unwrap_or(Qty::ZERO),
                avg_fill_price: update.avg_fill_price,
                status: update.status,
                reason: update.reason.clone(),
                info_text: update.info_text.clone(),
                first_update: update.timestamp,
                last_update: update.timestamp,
                exit_kind: None,
                high_while_open: None,
                low_while_open: None,
            }
        })
        .collect();

    records.sort_by(|a, b| {
        a.last_update
            .cmp(&b.last_update)
            .then_with(|| a.server_order_id.cmp(&b.server_order_id))
    });
    records
}

fn synthesize(
    updates: &[OrderUpdate],
    id: &str,
    indices: &[usize],
    fill_totals: &HashMap<String, (Decimal, Decimal)>,
    closers: &HashMap<String, (Price, Price)>,
) -> OrderRecord {
    // Terminal status: highest rank, then latest timestamp, then input
    // order.
    let terminal_idx = indices
        .iter()
        .copied()
        .max_by(|&a, &b| {
            let ua = &updates[a];
            let ub = &updates[b];
            ua.status
                .rank()
                .cmp(&ub.status.rank())
                .then_with(|| ua.timestamp.cmp(&ub.timestamp))
                .then_with(|| a.cmp(&b))
        })
        .expect("group is never empty");
    let terminal = &updates[terminal_idx];

    // Descriptive fields: later updates override earlier ones.
    let mut account = None;
    let mut symbol = String::new();
    let mut side = None;
    let mut kind = None;
    let mut requested_qty = None;
    let mut requested_price = None;
    let mut reported_cum = Qty::ZERO;
    let mut reported_avg: Option<(DateTime<Utc>, Price)> = None;
    let mut first_update = updates[indices[0]].timestamp;
    let mut last_update = first_update;

    for &i in indices {
        let update = &updates[i];
        if update.account.is_some() {
            account = update.account.clone();
        }
        if !update.symbol.is_empty() {
            symbol = update.symbol.clone();
        }
        side = update.side.or(side);
        kind = update.kind.or(kind);
        requested_qty = update.order_qty.or(requested_qty);
        requested_price = update.price.or(requested_price);
        if let Some(cum) = update.filled_qty {
            if cum > reported_cum {
                reported_cum = cum;
            }
        }
        if let Some(avg) = update.avg_fill_price {
            let newer = reported_avg.map_or(true, |(ts, _)| update.timestamp >= ts);
            if newer {
                reported_avg = Some((update.timestamp, avg));
            }
        }
        first_update = first_update.min(update.timestamp);
        last_update = last_update.max(update.timestamp);
    }

    // Fill quantities: trust the larger of reported-cumulative and the
    // sum of extracted fills.
    let (fill_qty_sum, fill_notional) = fill_totals
        .get(id)
        .copied()
        .unwrap_or((Decimal::ZERO, Decimal::ZERO));
    let filled_qty = Qty::new(reported_cum.inner().max(fill_qty_sum));

    // VWAP from priced fills, but only when they cover the full
    // reported volume; otherwise the server's latest average covers
    // more than we could price ourselves.
    let avg_fill_price = if fill_qty_sum > Decimal::ZERO && fill_qty_sum >= reported_cum.inner() {
        Some(Price::new(fill_notional / fill_qty_sum))
    } else if let Some((_, avg)) = reported_avg {
        Some(avg)
    } else if fill_qty_sum > Decimal::ZERO {
        Some(Price::new(fill_notional / fill_qty_sum))
    } else {
        None
    };

    let window = closers.get(id);

    OrderRecord {
        server_order_id: id.to_string(),
        account,
        symbol,
        side,
        kind,
        requested_qty,
        requested_price,
        filled_qty,
        avg_fill_price,
        status: terminal.status,
        reason: terminal.reason.clone(),
        info_text: terminal.info_text.clone(),
        first_update,
        last_update,
        exit_kind: window.and(kind).map(ExitKind::from_order_kind),
        high_while_open: window.map(|(high, _)| *high),
        low_while_open: window.map(|(_, low)| *low),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_714_000_000 + offset_secs, 0).unwrap()
    }

    fn update(id: &str, status: OrderStatus, offset_secs: i64) -> OrderUpdate {
        OrderUpdate {
            account: Some(AccountId::new("Sim1")),
            symbol: "ESZ5".to_string(),
            server_order_id: id.to_string(),
            status,
            side: None,
            kind: None,
            order_qty: None,
            price: None,
            filled_qty: None,
            last_fill_qty: None,
            last_fill_price: None,
            avg_fill_price: None,
            reason: None,
            info_text: None,
            request_id: None,
            timestamp: ts(offset_secs),
        }
    }

    /// The canonical fill sequence: New -> PartiallyFilled(1) ->
    /// Filled(2, avg 100.5).
    fn order_42() -> Vec<OrderUpdate> {
        let mut new = update("42", OrderStatus::New, 0);
        new.side = Some(OrderSide::Buy);
        new.kind = Some(OrderKind::Limit);
        new.order_qty = Some(Qty::new(dec!(2)));

        let mut partial = update("42", OrderStatus::PartiallyFilled, 5);
        partial.filled_qty = Some(Qty::new(dec!(1)));

        let mut filled = update("42", OrderStatus::Filled, 11);
        filled.filled_qty = Some(Qty::new(dec!(2)));
        filled.avg_fill_price = Some(Price::new(dec!(100.5)));

        vec![new, partial, filled]
    }

    #[test]
    fn test_terminal_record_for_filled_order() {
        let records = build_ledger(&order_42());
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.server_order_id, "42");
        assert_eq!(record.status, OrderStatus::Filled);
        assert_eq!(record.filled_qty, Qty::new(dec!(2)));
        assert_eq!(record.avg_fill_price, Some(Price::new(dec!(100.5))));
        assert_eq!(record.duration(), Duration::seconds(11));
        assert_eq!(record.first_update, ts(0));
        assert_eq!(record.last_update, ts(11));
    }

    #[test]
    fn test_terminal_rank_beats_timestamp() {
        // A late Open update must not demote an already-Filled order.
        let mut updates = order_42();
        updates.push(update("42", OrderStatus::Open, 20));

        let records = build_ledger(&updates);
        assert_eq!(records[0].status, OrderStatus::Filled);
        // But the record's last_update still covers every update seen.
        assert_eq!(records[0].last_update, ts(20));
    }

    #[test]
    fn test_rank_tie_broken_by_latest_timestamp() {
        // Canceled (rank 5) at t=3 vs Filled (rank 5) at t=9: Filled
        // wins on timestamp.
        let updates = vec![
            update("7", OrderStatus::Canceled, 3),
            update("7", OrderStatus::Filled, 9),
        ];
        assert_eq!(build_ledger(&updates)[0].status, OrderStatus::Filled);

        // Reversed timestamps: Canceled wins.
        let updates = vec![
            update("7", OrderStatus::Filled, 9),
            update("7", OrderStatus::Canceled, 12),
        ];
        assert_eq!(build_ledger(&updates)[0].status, OrderStatus::Canceled);
    }

    #[test]
    fn test_vwap_from_explicit_fills() {
        let mut first = update("9", OrderStatus::PartiallyFilled, 1);
        first.side = Some(OrderSide::Buy);
        first.last_fill_qty = Some(Qty::new(dec!(1)));
        first.last_fill_price = Some(Price::new(dec!(100)));
        first.filled_qty = Some(Qty::new(dec!(1)));

        let mut second = update("9", OrderStatus::Filled, 2);
        second.last_fill_qty = Some(Qty::new(dec!(3)));
        second.last_fill_price = Some(Price::new(dec!(104)));
        second.filled_qty = Some(Qty::new(dec!(4)));

        let records = build_ledger(&[first, second]);
        // VWAP = (1*100 + 3*104) / 4 = 103
        assert_eq!(records[0].avg_fill_price, Some(Price::new(dec!(103))));
        assert_eq!(records[0].filled_qty, Qty::new(dec!(4)));
    }

    #[test]
    fn test_ledger_is_deterministic() {
        let mut updates = order_42();
        let mut exit = update("43", OrderStatus::Filled, 30);
        exit.side = Some(OrderSide::Sell);
        exit.kind = Some(OrderKind::Stop);
        exit.last_fill_qty = Some(Qty::new(dec!(2)));
        exit.last_fill_price = Some(Price::new(dec!(98.75)));
        updates.push(exit);

        let first = serde_json::to_string(&build_ledger(&updates)).unwrap();
        let second = serde_json::to_string(&build_ledger(&updates)).unwrap();
        assert_eq!(first, second);

        let fills_a = serde_json::to_string(&fill_stream(&updates)).unwrap();
        let fills_b = serde_json::to_string(&fill_stream(&updates)).unwrap();
        assert_eq!(fills_a, fills_b);
    }

    #[test]
    fn test_snapshot_returns_latest_irrespective_of_rank() {
        let mut updates = order_42();
        // Latest by timestamp is a (spurious) Open after the fill.
        updates.push(update("42", OrderStatus::Open, 20));

        let snap = snapshot(&updates);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].status, OrderStatus::Open);
    }

    #[test]
    fn test_fill_stream_is_chronological_across_orders() {
        let mut a1 = update("A", OrderStatus::PartiallyFilled, 10);
        a1.side = Some(OrderSide::Buy);
        a1.last_fill_qty = Some(Qty::new(dec!(1)));
        a1.last_fill_price = Some(Price::new(dec!(100)));

        let mut b1 = update("B", OrderStatus::Filled, 4);
        b1.side = Some(OrderSide::Sell);
        b1.last_fill_qty = Some(Qty::new(dec!(2)));
        b1.last_fill_price = Some(Price::new(dec!(99)));

        let mut a2 = update("A", OrderStatus::Filled, 15);
        a2.last_fill_qty = Some(Qty::new(dec!(1)));
        a2.last_fill_price = Some(Price::new(dec!(101)));

        let fills = fill_stream(&[a1, b1, a2]);
        assert_eq!(fills.len(), 3);
        assert_eq!(fills[0].server_order_id, "B");
        assert_eq!(fills[1].server_order_id, "A");
        assert_eq!(fills[2].server_order_id, "A");
        // Side is inherited from the order's last known side.
        assert_eq!(fills[2].side, Some(OrderSide::Buy));
    }

    #[test]
    fn test_exit_classification_and_extremes() {
        // Entry: limit buy 2 @ 100. Exit: stop sell 2 @ 95.
        let mut entry = update("E1", OrderStatus::Filled, 0);
        entry.side = Some(OrderSide::Buy);
        entry.kind = Some(OrderKind::Limit);
        entry.last_fill_qty = Some(Qty::new(dec!(2)));
        entry.last_fill_price = Some(Price::new(dec!(100)));

        let mut exit = update("X1", OrderStatus::Filled, 60);
        exit.side = Some(OrderSide::Sell);
        exit.kind = Some(OrderKind::Stop);
        exit.last_fill_qty = Some(Qty::new(dec!(2)));
        exit.last_fill_price = Some(Price::new(dec!(95)));

        let records = build_ledger(&[entry, exit]);
        let entry_rec = records.iter().find(|r| r.server_order_id == "E1").unwrap();
        let exit_rec = records.iter().find(|r| r.server_order_id == "X1").unwrap();

        // Only the closing order carries the exit classification.
        assert_eq!(entry_rec.exit_kind, None);
        assert_eq!(exit_rec.exit_kind, Some(ExitKind::Stop));
        assert_eq!(exit_rec.high_while_open, Some(Price::new(dec!(100))));
        assert_eq!(exit_rec.low_while_open, Some(Price::new(dec!(95))));
    }

    #[test]
    fn test_partial_exit_keeps_window_open() {
        let mut entry = update("E2", OrderStatus::Filled, 0);
        entry.side = Some(OrderSide::Buy);
        entry.kind = Some(OrderKind::Limit);
        entry.last_fill_qty = Some(Qty::new(dec!(2)));
        entry.last_fill_price = Some(Price::new(dec!(100)));

        // Sells only half: still open, no exit classification yet.
        let mut half = update("X2", OrderStatus::Filled, 30);
        half.side = Some(OrderSide::Sell);
        half.kind = Some(OrderKind::Limit);
        half.last_fill_qty = Some(Qty::new(dec!(1)));
        half.last_fill_price = Some(Price::new(dec!(103)));

        let records = build_ledger(&[entry, half]);
        assert!(records.iter().all(|r| r.exit_kind.is_none()));
    }

    #[test]
    fn test_empty_input_yields_empty_views() {
        assert!(build_ledger(&[]).is_empty());
        assert!(snapshot(&[]).is_empty());
        assert!(fill_stream(&[]).is_empty());
    }
}
