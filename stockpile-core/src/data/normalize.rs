//! Schema normalization at the ingestion boundary.
//!
//! Remote batches arrive with whatever header spelling the source uses
//! (`Date`, ` DATE `, `Close Price`...). This module maps them onto the fixed
//! [`Record`] shape. A batch that cannot be mapped is malformed and the unit
//! that produced it is skipped.

use super::provider::RawBatch;
use super::record::Record;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("batch has no date column (headers: {headers:?})")]
    MissingDateColumn { headers: Vec<String> },

    #[error("batch has no '{0}' column")]
    MissingColumn(&'static str),

    #[error("row {row}: unparseable date '{value}'")]
    InvalidDate { row: usize, value: String },

    #[error("row {row}: unparseable {column} '{value}'")]
    InvalidNumber {
        row: usize,
        column: &'static str,
        value: String,
    },
}

/// Accepted spellings per canonical column, after [`normalize_header`].
const ALIASES: [(&str, &[&str]); 6] = [
    ("date", &["date", "timestamp", "trade_date"]),
    ("open", &["open", "open_price"]),
    ("high", &["high", "high_price"]),
    ("low", &["low", "low_price"]),
    ("close", &["close", "close_price"]),
    ("volume", &["volume", "vol", "total_traded_quantity"]),
];

const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d",
    "%d-%b-%Y",
    "%d-%m-%Y",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%Y%m%d",
];

/// Lowercase, trim, and collapse inner whitespace runs to `_`.
pub fn normalize_header(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
        .replace('.', "")
}

/// Resolve canonical column name → index in `headers`. First match wins.
pub fn resolve_columns(headers: &[String]) -> HashMap<&'static str, usize> {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    let mut found = HashMap::new();
    for (canonical, spellings) in ALIASES {
        if let Some(idx) = normalized
            .iter()
            .position(|h| spellings.contains(&h.as_str()))
        {
            found.insert(canonical, idx);
        }
    }
    found
}

/// Parse a date cell in any of the formats sources are known to emit.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    // Datetime cells: keep the date part.
    let head = s.split(['T', ' ']).next().unwrap_or(s);
    if head.len() < s.len() {
        return parse_date(head);
    }
    None
}

fn is_missing(s: &str) -> bool {
    matches!(
        s.to_ascii_lowercase().as_str(),
        "" | "-" | "null" | "none" | "nan" | "n/a"
    )
}

pub(crate) fn parse_price(raw: &str, row: usize, column: &'static str) -> Result<f64, NormalizeError> {
    let s = raw.trim().replace(',', "");
    if is_missing(&s) {
        return Ok(f64::NAN);
    }
    s.parse::<f64>().map_err(|_| NormalizeError::InvalidNumber {
        row,
        column,
        value: raw.to_string(),
    })
}

pub(crate) fn parse_volume(raw: &str, row: usize) -> Result<u64, NormalizeError> {
    let s = raw.trim().replace(',', "");
    if is_missing(&s) {
        return Ok(0);
    }
    if let Ok(v) = s.parse::<u64>() {
        return Ok(v);
    }
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(v.round() as u64),
        _ => Err(NormalizeError::InvalidNumber {
            row,
            column: "volume",
            value: raw.to_string(),
        }),
    }
}

/// Convert a raw batch into records sorted by date, first occurrence of a
/// date winning.
pub fn normalize_batch(batch: &RawBatch) -> Result<Vec<Record>, NormalizeError> {
    let cols = resolve_columns(&batch.headers);

    let date_idx = *cols
        .get("date")
        .ok_or_else(|| NormalizeError::MissingDateColumn {
            headers: batch.headers.clone(),
        })?;
    let idx = |name: &'static str| cols.get(name).copied().ok_or(NormalizeError::MissingColumn(name));
    let (open_idx, high_idx, low_idx, close_idx, volume_idx) =
        (idx("open")?, idx("high")?, idx("low")?, idx("close")?, idx("volume")?);

    let mut by_date: BTreeMap<NaiveDate, Record> = BTreeMap::new();
    for (row_no, row) in batch.rows.iter().enumerate() {
        let cell = |i: usize| row.get(i).map(String::as_str).unwrap_or("");

        let raw_date = cell(date_idx);
        let date = parse_date(raw_date).ok_or_else(|| NormalizeError::InvalidDate {
            row: row_no,
            value: raw_date.to_string(),
        })?;

        let record = Record {
            date,
            open: parse_price(cell(open_idx), row_no, "open")?,
            high: parse_price(cell(high_idx), row_no, "high")?,
            low: parse_price(cell(low_idx), row_no, "low")?,
            close: parse_price(cell(close_idx), row_no, "close")?,
            volume: parse_volume(cell(volume_idx), row_no)?,
        };
        by_date.entry(date).or_insert(record);
    }

    Ok(by_date.into_values().collect())
}
