//! Bulk stock import from tabular files.
//!
//! CSV goes through `csv`, `.xlsx`/`.xls` workbooks through `calamine` (first
//! sheet only). Either parser hands back rows of cells; only the identifier
//! and display name columns are consumed. Columns are auto-detected from
//! header names and can be overridden explicitly.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use calamine::{Data, Reader};
use thiserror::Error;

use stockcount_core::{Serial, StockItem};

use crate::backend::{BackendError, BackendStore};

/// Rows per backend upsert call.
pub const IMPORT_CHUNK_SIZE: usize = 1000;

const SERIAL_HINTS: [&str; 3] = ["s/n", "serial", "sn"];
const NAME_HINTS: [&str; 3] = ["name", "ชื่อ", "product"];

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read import file: {0}")]
    Io(String),

    #[error("malformed tabular data: {0}")]
    Parse(String),

    #[error("unsupported import file type {0:?}; expected csv, xlsx or xls")]
    UnsupportedFormat(String),

    #[error("no {0} column found in headers")]
    MissingColumn(&'static str),

    #[error("column {index} out of range ({width} columns)")]
    ColumnOutOfRange { index: usize, width: usize },

    #[error("import file contains no usable rows")]
    Empty,

    #[error("upsert failed after {done} of {total} rows: {source}")]
    Backend {
        done: usize,
        total: usize,
        #[source]
        source: BackendError,
    },
}

/// Which columns hold the identifier and the display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMapping {
    pub serial: usize,
    pub name: usize,
}

/// Pick columns by header name. When several headers match, the last wins.
pub fn detect_columns<S: AsRef<str>>(headers: &[S]) -> Result<ColumnMapping, ImportError> {
    let mut serial = None;
    let mut name = None;
    for (idx, header) in headers.iter().enumerate() {
        let lower = header.as_ref().to_lowercase();
        if SERIAL_HINTS.iter().any(|h| lower.contains(h)) {
            serial = Some(idx);
        }
        if NAME_HINTS.iter().any(|h| lower.contains(h)) {
            name = Some(idx);
        }
    }

    Ok(ColumnMapping {
        serial: serial.ok_or(ImportError::MissingColumn("serial"))?,
        name: name.ok_or(ImportError::MissingColumn("name"))?,
    })
}

/// A parsed tabular file: one header row plus data rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockSheet {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl StockSheet {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let rows = rows
            .into_iter()
            .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
            .collect();
        Self { headers, rows }
    }

    /// Parse comma-separated text. A leading byte-order mark is ignored and
    /// blank rows are skipped.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self, ImportError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| ImportError::Parse(e.to_string()))?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h };
                h.trim().to_string()
            })
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| ImportError::Parse(e.to_string()))?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self::new(headers, rows))
    }

    /// Read the first worksheet of an `.xlsx` or `.xls` workbook. The first
    /// row of the sheet is the header row.
    pub fn from_workbook(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref();
        let mut workbook = calamine::open_workbook_auto(path)
            .map_err(|e| ImportError::Parse(format!("{}: {e}", path.display())))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or(ImportError::Empty)?
            .map_err(|e| ImportError::Parse(e.to_string()))?;

        let mut rows = range
            .rows()
            .map(|row| row.iter().map(cell_text).collect::<Vec<String>>());
        let headers = rows
            .next()
            .ok_or(ImportError::Empty)?
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect();
        Ok(Self::new(headers, rows.collect()))
    }

    /// Pick the parser from the file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "csv" => {
                let file = std::fs::File::open(path)
                    .map_err(|e| ImportError::Io(format!("{}: {e}", path.display())))?;
                Self::from_csv(std::io::BufReader::new(file))
            }
            "xlsx" | "xls" => Self::from_workbook(path),
            _ => Err(ImportError::UnsupportedFormat(extension)),
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn detect_columns(&self) -> Result<ColumnMapping, ImportError> {
        detect_columns(&self.headers)
    }

    /// Extract stock items. Rows with a blank identifier are skipped and a
    /// repeated identifier keeps its last row.
    pub fn items(&self, mapping: ColumnMapping) -> Result<Vec<StockItem>, ImportError> {
        let width = self.headers.len();
        for index in [mapping.serial, mapping.name] {
            if index >= width {
                return Err(ImportError::ColumnOutOfRange { index, width });
            }
        }

        let mut by_serial: BTreeMap<Serial, StockItem> = BTreeMap::new();
        for row in &self.rows {
            let raw = row.get(mapping.serial).map(String::as_str).unwrap_or("");
            let Ok(serial) = Serial::parse(raw) else {
                continue;
            };
            let name = row.get(mapping.name).map(|n| n.trim()).unwrap_or("");
            by_serial.insert(serial.clone(), StockItem::new(serial, name));
        }

        if by_serial.is_empty() {
            return Err(ImportError::Empty);
        }
        Ok(by_serial.into_values().collect())
    }
}

/// Cell as text. Whole numbers lose the `.0` a float cell would print, so a
/// numeric serial typed into a spreadsheet matches its barcode.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(text) => text.clone(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

/// Progress of a chunked import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportProgress {
    pub done: usize,
    pub total: usize,
}

/// Upsert items in chunks, reporting progress after each chunk.
///
/// Stops at the first failed chunk; earlier chunks stay written.
pub async fn upload_stock<B>(
    backend: &B,
    items: &[StockItem],
    chunk_size: usize,
    mut on_progress: impl FnMut(ImportProgress) + Send,
) -> Result<usize, ImportError>
where
    B: BackendStore + ?Sized,
{
    let total = items.len();
    let mut done = 0;
    for chunk in items.chunks(chunk_size.max(1)) {
        backend
            .upsert_stock_items(chunk)
            .await
            .map_err(|source| ImportError::Backend {
                done,
                total,
                source,
            })?;
        done += chunk.len();
        tracing::debug!(done, total, "stock chunk upserted");
        on_progress(ImportProgress { done, total });
    }
    tracing::info!(count = total, "stock import complete");
    Ok(total)
}
