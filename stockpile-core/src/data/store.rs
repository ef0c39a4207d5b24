//! Per-symbol dataset store.
//!
//! Layout: `{data_dir}/{SYMBOL}.csv` plus a `{SYMBOL}.meta.json` sidecar.
//!
//! Features:
//! - Idempotent, order-invariant merge (dedupe by date, re-sort, rewrite)
//! - Atomic writes (write to .tmp, rename into place)
//! - Case-insensitive column lookup on read
//! - Corrupt stores are reported, never repaired or overwritten
//! - Metadata sidecar per symbol (hash, date range, row count)

use super::normalize::{normalize_header, parse_date, parse_price, parse_volume};
use super::record::{Record, COLUMNS, DATE_FORMAT};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Existing data is unreadable or keyless. Needs an operator.
    #[error("corrupt store for '{symbol}' at {path}: {reason}")]
    Corrupt {
        symbol: String,
        path: PathBuf,
        reason: String,
    },

    #[error("store I/O error for '{symbol}': {source}")]
    Io {
        symbol: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

/// Metadata sidecar for a stored symbol. Informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub symbol: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub row_count: usize,
    pub data_hash: String,
    pub written_at: chrono::NaiveDateTime,
}

/// Result of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Rows that were not stored before.
    pub added: usize,
    /// Rows in the store after the merge.
    pub total: usize,
    /// Latest stored date after the merge.
    pub last_date: Option<NaiveDate>,
}

/// How much of a symbol is already stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Coverage {
    NotStored,
    Through {
        first: NaiveDate,
        last: NaiveDate,
        rows: usize,
    },
    Unreadable(String),
}

impl Coverage {
    /// Latest stored date, if the store is readable and non-empty.
    pub fn last_date(&self) -> Option<NaiveDate> {
        match self {
            Coverage::Through { last, .. } => Some(*last),
            _ => None,
        }
    }
}

/// Status line for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub symbol: String,
    pub stored: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub row_count: Option<usize>,
}

/// The dataset store. One CSV per symbol under `data_dir`.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    data_dir: PathBuf,
}

impl DatasetStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// `{data_dir}/{SYMBOL}.csv`
    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.data_dir.join(format!("{symbol}.csv"))
    }

    fn meta_path(&self, symbol: &str) -> PathBuf {
        self.data_dir.join(format!("{symbol}.meta.json"))
    }

    /// Load all stored records for a symbol in persisted (date) order.
    ///
    /// `Ok(None)` when nothing has been stored yet.
    pub fn load(&self, symbol: &str) -> Result<Option<Vec<Record>>, StoreError> {
        let path = self.path_for(symbol);
        if !path.exists() {
            return Ok(None);
        }
        read_records(symbol, &path).map(Some)
    }

    /// Latest stored date. This is what skip decisions are made against.
    pub fn max_date(&self, symbol: &str) -> Result<Option<NaiveDate>, StoreError> {
        Ok(self
            .load(symbol)?
            .and_then(|records| records.last().map(|r| r.date)))
    }

    pub fn coverage(&self, symbol: &str) -> Coverage {
        match self.load(symbol) {
            Ok(None) => Coverage::NotStored,
            Ok(Some(records)) => match (records.first(), records.last()) {
                (Some(first), Some(last)) => Coverage::Through {
                    first: first.date,
                    last: last.date,
                    rows: records.len(),
                },
                _ => Coverage::NotStored,
            },
            Err(e) => Coverage::Unreadable(e.to_string()),
        }
    }

    /// Merge newly fetched records into a symbol's store.
    ///
    /// Records whose date is already stored are dropped; the union is sorted
    /// by date and written back in full. Re-merging the same batch is a no-op
    /// and the result does not depend on arrival order.
    pub fn merge(&self, symbol: &str, incoming: &[Record]) -> Result<MergeOutcome, StoreError> {
        let existing = self.load(symbol)?.unwrap_or_default();
        let mut seen: HashSet<NaiveDate> = existing.iter().map(|r| r.date).collect();

        let fresh: Vec<Record> = incoming
            .iter()
            .filter(|r| seen.insert(r.date))
            .cloned()
            .collect();

        if fresh.is_empty() {
            debug!(symbol, total = existing.len(), "merge: nothing new");
            return Ok(MergeOutcome {
                added: 0,
                total: existing.len(),
                last_date: existing.last().map(|r| r.date),
            });
        }

        let added = fresh.len();
        let mut merged = existing;
        merged.extend(fresh);
        merged.sort_by_key(|r| r.date);

        self.write_atomic(symbol, &merged)?;
        self.write_meta(symbol, &merged)?;

        Ok(MergeOutcome {
            added,
            total: merged.len(),
            last_date: merged.last().map(|r| r.date),
        })
    }

    /// Sidecar metadata, if present and parseable.
    pub fn meta(&self, symbol: &str) -> Option<StoreMeta> {
        let content = fs::read_to_string(self.meta_path(symbol)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Which symbols have stored data, and their date ranges (from sidecars).
    pub fn status(&self, symbols: &[&str]) -> Vec<StoreStatus> {
        symbols
            .iter()
            .map(|sym| {
                let meta = self.meta(sym);
                StoreStatus {
                    symbol: sym.to_string(),
                    stored: meta.is_some(),
                    start_date: meta.as_ref().map(|m| m.start_date),
                    end_date: meta.as_ref().map(|m| m.end_date),
                    row_count: meta.as_ref().map(|m| m.row_count),
                }
            })
            .collect()
    }

    fn write_atomic(&self, symbol: &str, records: &[Record]) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            symbol: symbol.to_string(),
            source,
        };
        fs::create_dir_all(&self.data_dir).map_err(io_err)?;

        let path = self.path_for(symbol);
        let tmp_path = path.with_extension("csv.tmp");

        write_records(&tmp_path, records).map_err(io_err)?;

        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            io_err(e)
        })
    }

    fn write_meta(&self, symbol: &str, records: &[Record]) -> Result<(), StoreError> {
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Ok(());
        };
        let io_err = |source| StoreError::Io {
            symbol: symbol.to_string(),
            source,
        };

        let hash_input = serde_json::to_vec(records)
            .map_err(|e| io_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let meta = StoreMeta {
            symbol: symbol.to_string(),
            start_date: first.date,
            end_date: last.date,
            row_count: records.len(),
            data_hash: blake3::hash(&hash_input).to_hex().to_string(),
            written_at: chrono::Local::now().naive_local(),
        };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| io_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let path = self.meta_path(symbol);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(io_err)?;
        fs::rename(&tmp_path, &path).map_err(io_err)
    }
}

// ── CSV I/O helpers ─────────────────────────────────────────────────

fn write_records(path: &Path, records: &[Record]) -> io::Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_to_io)?;
    writer.write_record(COLUMNS).map_err(csv_to_io)?;
    for r in records {
        writer
            .write_record([
                r.date.format(DATE_FORMAT).to_string(),
                r.open.to_string(),
                r.high.to_string(),
                r.low.to_string(),
                r.close.to_string(),
                r.volume.to_string(),
            ])
            .map_err(csv_to_io)?;
    }
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    file.sync_all()
}

fn csv_to_io(e: csv::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// Read a stored CSV. Any structural problem is a corrupt store.
fn read_records(symbol: &str, path: &Path) -> Result<Vec<Record>, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        symbol: symbol.to_string(),
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| corrupt(format!("open: {e}")))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| corrupt(format!("header: {e}")))?
        .iter()
        .map(normalize_header)
        .collect();

    let col = |name: &'static str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| corrupt(format!("no {name} column")))
    };
    let date_idx = col("date")?;
    let (open_idx, high_idx, low_idx, close_idx, volume_idx) =
        (col("open")?, col("high")?, col("low")?, col("close")?, col("volume")?);

    // A cell that does not parse must not be rewritten as NaN or 0 by the
    // next merge, so it makes the whole store corrupt.
    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|e| corrupt(format!("row {line}: {e}")))?;
        let cell = |i: usize| row.get(i).unwrap_or("");

        let raw_date = cell(date_idx);
        let date = parse_date(raw_date)
            .ok_or_else(|| corrupt(format!("row {line}: bad date '{raw_date}'")))?;

        let price = |i: usize, column: &'static str| {
            parse_price(cell(i), line, column).map_err(|e| corrupt(e.to_string()))
        };
        records.push(Record {
            date,
            open: price(open_idx, "open")?,
            high: price(high_idx, "high")?,
            low: price(low_idx, "low")?,
            close: price(close_idx, "close")?,
            volume: parse_volume(cell(volume_idx), line).map_err(|e| corrupt(e.to_string()))?,
        });
    }

    // Files written by hand or by older tools may be unsorted.
    if records.windows(2).any(|w| w[0].date >= w[1].date) {
        records.sort_by_key(|r| r.date);
        records.dedup_by_key(|r| r.date);
    }

    Ok(records)
}
