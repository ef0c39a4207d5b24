//! The fixed internal record shape.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One calendar-day OHLCV observation for a symbol.
///
/// `date` is the unique key inside a symbol's store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Persisted column order.
pub const COLUMNS: [&str; 6] = ["date", "open", "high", "low", "close", "volume"];

/// Date format used in persisted files and progress lines.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
