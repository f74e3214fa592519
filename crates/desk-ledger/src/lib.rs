//! Order ledger builder.
//!
//! Replays a sequence of order-update messages into three views:
//! - `build_ledger`: one terminal record per server order id
//! - `snapshot`: the most recent record per order, whatever its rank
//! - `fill_stream`: every fill, chronologically
//!
//! All three are pure functions of the input sequence; re-running on
//! the same input yields identical output, which makes offline replay
//! and audit exports trivial.

pub mod builder;
pub mod error;
pub mod export;

pub use builder::{build_ledger, fill_stream, snapshot, ExitKind, FillRow, OrderRecord};
pub use error::{LedgerError, LedgerResult};
pub use export::{write_fills, write_ledger, JsonLinesWriter};
