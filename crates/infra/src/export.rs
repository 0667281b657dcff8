//! Spreadsheet-friendly CSV exports.
//!
//! UTF-8 with a byte-order mark, every data cell quoted.

use std::path::Path;

use chrono::{DateTime, Utc};
use csv::{QuoteStyle, WriterBuilder};
use thiserror::Error;

use stockcount_core::{CountEvent, DashboardSummary, TimestampStyle};

const BOM: &str = "\u{feff}";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("nothing to export")]
    Empty,

    #[error("csv encoding failed: {0}")]
    Csv(String),

    #[error("failed to write export: {0}")]
    Io(String),
}

impl From<csv::Error> for ExportError {
    fn from(e: csv::Error) -> Self {
        ExportError::Csv(e.to_string())
    }
}

/// Confirmed count records: identifier, name, timestamp, operator.
pub fn count_records_csv(
    events: &[CountEvent],
    style: &TimestampStyle,
) -> Result<String, ExportError> {
    if events.is_empty() {
        return Err(ExportError::Empty);
    }

    let mut body = Vec::new();
    {
        let mut w = quoted_writer(&mut body);
        w.write_record(["Serial Number", "Product Name", "Timestamp", "Employee ID"])?;
        for e in events {
            w.write_record([
                e.serial.as_str(),
                e.name.as_str(),
                style.format(e.created_at).as_str(),
                e.operator.as_str(),
            ])?;
        }
        w.flush().map_err(|e| ExportError::Io(e.to_string()))?;
    }
    finish(body)
}

/// Dashboard report: numbered detail rows, then SUMMARY and TOP PERFORMERS.
///
/// `events` are listed in the given order; the leaderboard covers every
/// operator, not just the top N.
pub fn dashboard_report_csv(
    total_stock: usize,
    events: &[CountEvent],
    style: &TimestampStyle,
    now: DateTime<Utc>,
) -> Result<String, ExportError> {
    if events.is_empty() {
        return Err(ExportError::Empty);
    }
    let summary = DashboardSummary::compute_with(total_stock, events, style, now, usize::MAX, 0);

    let mut body = Vec::new();
    {
        let mut w = quoted_writer(&mut body);
        w.write_record(["#", "Serial Number", "Product Name", "Employee ID", "Timestamp"])?;
        for (i, e) in events.iter().enumerate() {
            let name = if e.name.is_empty() { "-" } else { e.name.as_str() };
            w.write_record([
                (i + 1).to_string().as_str(),
                e.serial.as_str(),
                name,
                e.operator.as_str(),
                style.format(e.created_at).as_str(),
            ])?;
        }
        w.flush().map_err(|e| ExportError::Io(e.to_string()))?;
    }

    body.push(b'\n');
    {
        let mut w = plain_writer(&mut body);
        w.write_record(["SUMMARY"])?;
        w.write_record(["Total Stock", summary.total_stock.to_string().as_str()])?;
        w.write_record(["Total Scanned", summary.total_scanned.to_string().as_str()])?;
        w.write_record(["Remaining", summary.remaining.to_string().as_str()])?;
        w.write_record(["Progress", format!("{}%", summary.progress_percent).as_str()])?;
        w.flush().map_err(|e| ExportError::Io(e.to_string()))?;
    }

    body.push(b'\n');
    {
        let mut w = plain_writer(&mut body);
        w.write_record(["TOP PERFORMERS"])?;
        w.write_record(["Employee ID", "Count"])?;
        for tally in &summary.leaderboard {
            w.write_record([tally.operator.as_str(), tally.count.to_string().as_str()])?;
        }
        w.flush().map_err(|e| ExportError::Io(e.to_string()))?;
    }
    finish(body)
}

/// `count_records_YYYY-MM-DD.csv`
pub fn count_records_file_name(now: DateTime<Utc>) -> String {
    format!("count_records_{}.csv", now.format("%Y-%m-%d"))
}

/// `stock_counting_report_YYYY-MM-DD.csv`
pub fn report_file_name(now: DateTime<Utc>) -> String {
    format!("stock_counting_report_{}.csv", now.format("%Y-%m-%d"))
}

pub fn write_export(path: impl AsRef<Path>, contents: &str) -> Result<(), ExportError> {
    let path = path.as_ref();
    std::fs::write(path, contents).map_err(|e| ExportError::Io(format!("{}: {e}", path.display())))
}

fn quoted_writer<W: std::io::Write>(w: W) -> csv::Writer<W> {
    WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .from_writer(w)
}

fn plain_writer<W: std::io::Write>(w: W) -> csv::Writer<W> {
    WriterBuilder::new()
        .flexible(true)
        .quote_style(QuoteStyle::Necessary)
        .from_writer(w)
}

fn finish(body: Vec<u8>) -> Result<String, ExportError> {
    let text = String::from_utf8(body).map_err(|e| ExportError::Csv(e.to_string()))?;
    Ok(format!("{BOM}{text}"))
}
