//! Tabular export for ledger views.
//!
//! Two formats: delimited text (header row plus one line per record)
//! and JSON Lines. The JSONL writer appends, so an interrupted export
//! only ever truncates its final line.

use crate::builder::{FillRow, OrderRecord};
use crate::error::LedgerResult;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(T::to_string).unwrap_or_default()
}

const LEDGER_COLUMNS: &[&str] = &[
    "server_order_id",
    "account",
    "symbol",
    "side",
    "kind",
    "requested_qty",
    "requested_price",
    "filled_qty",
    "avg_fill_price",
    "status",
    "reason",
    "info_text",
    "first_update",
    "last_update",
    "duration_ms",
    "exit_kind",
    "high_while_open",
    "low_while_open",
];

/// Write ledger or snapshot records as delimited text.
pub fn write_ledger<W: Write>(
    out: &mut W,
    records: &[OrderRecord],
    delimiter: char,
) -> LedgerResult<()> {
    writeln!(out, "{}", LEDGER_COLUMNS.join(&delimiter.to_string()))?;
    for record in records {
        let row = [
            record.server_order_id.clone(),
            opt(&record.account),
            record.symbol.clone(),
            opt(&record.side),
            opt(&record.kind),
            opt(&record.requested_qty),
            opt(&record.requested_price),
            record.filled_qty.to_string(),
            opt(&record.avg_fill_price),
            record.status.to_string(),
            opt(&record.reason),
            opt(&record.info_text),
            record.first_update.to_rfc3339(),
            record.last_update.to_rfc3339(),
            record.duration().num_milliseconds().to_string(),
            opt(&record.exit_kind),
            opt(&record.high_while_open),
            opt(&record.low_while_open),
        ];
        writeln!(out, "{}", row.join(&delimiter.to_string()))?;
    }
    Ok(())
}

const FILL_COLUMNS: &[&str] = &[
    "server_order_id",
    "account",
    "symbol",
    "side",
    "qty",
    "price",
    "timestamp",
];

/// Write a fill stream as delimited text.
pub fn write_fills<W: Write>(
    out: &mut W,
    fills: &[FillRow],
    delimiter: char,
) -> LedgerResult<()> {
    writeln!(out, "{}", FILL_COLUMNS.join(&delimiter.to_string()))?;
    for fill in fills {
        let row = [
            fill.server_order_id.clone(),
            opt(&fill.account),
            fill.symbol.clone(),
            opt(&fill.side),
            fill.qty.to_string(),
            fill.price.to_string(),
            fill.timestamp.to_rfc3339(),
        ];
        writeln!(out, "{}", row.join(&delimiter.to_string()))?;
    }
    Ok(())
}

/// JSON Lines writer.
///
/// Opens in append mode; each record is one complete JSON object per
/// line, so partial corruption only ever affects individual lines.
pub struct JsonLinesWriter {
    writer: BufWriter<File>,
    records_written: usize,
}

impl JsonLinesWriter {
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), "Opened JSON Lines writer (append mode)");
        Ok(Self {
            writer: BufWriter::new(file),
            records_written: 0,
        })
    }

    /// Append one record as a JSON line.
    pub fn write<T: Serialize>(&mut self, record: &T) -> LedgerResult<()> {
        let json = serde_json::to_string(record)?;
        writeln!(self.writer, "{json}")?;
        self.records_written += 1;
        Ok(())
    }

    /// Append a batch of records and flush to disk.
    pub fn write_all<T: Serialize>(&mut self, records: &[T]) -> LedgerResult<()> {
        for record in records {
            self.write(record)?;
        }
        self.flush()
    }

    pub fn flush(&mut self) -> LedgerResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn records_written(&self) -> usize {
        self.records_written
    }
}
