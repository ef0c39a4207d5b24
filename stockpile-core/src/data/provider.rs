//! Remote data source trait and structured error types.
//!
//! The DataProvider trait abstracts over data sources (Yahoo Finance, the
//! synthetic generator) so the worker can be driven by a fake in tests.
//! Providers return loosely-typed tabular rows; turning them into
//! [`Record`](super::record::Record)s is the job of the normalization step.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which price series to request from the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SeriesKind {
    /// Regular equity segment ("EQ").
    #[default]
    #[serde(rename = "EQ")]
    Equity,
    /// Trade-for-trade segment ("BE").
    #[serde(rename = "BE")]
    TradeForTrade,
}

impl SeriesKind {
    pub fn code(&self) -> &'static str {
        match self {
            SeriesKind::Equity => "EQ",
            SeriesKind::TradeForTrade => "BE",
        }
    }
}

impl fmt::Display for SeriesKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One request against the remote source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub series: SeriesKind,
}

/// Tabular rows as the remote source returned them.
///
/// Header names are kept verbatim (any case, any padding). Every row is
/// expected to have one cell per header, but short rows are tolerated by the
/// normalizer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawBatch {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Failures reported by a remote data source.
///
/// Displayed verbatim in the worker log and the progress log.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("remote error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Errors after which no further request in this process can succeed.
    pub fn is_process_fatal(&self) -> bool {
        matches!(
            self,
            RemoteError::CircuitBreakerTripped | RemoteError::AuthenticationRequired(_)
        )
    }

    /// Errors that say nothing more will ever come back for this symbol.
    pub fn is_symbol_fatal(&self) -> bool {
        matches!(self, RemoteError::SymbolNotFound { .. })
    }
}

/// Trait for remote market-data sources.
///
/// Implementations handle the specifics of one source. The dataset store sits
/// above this trait; providers know nothing about what is already stored.
pub trait DataProvider {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch daily rows for one symbol over an inclusive date range.
    ///
    /// An empty batch is a valid answer (no trading in the range, or the
    /// symbol was not listed yet).
    fn fetch(&self, request: &FetchRequest) -> Result<RawBatch, RemoteError>;

    /// How long the provider will keep refusing requests, if it is blocked
    /// right now. The worker waits this out before its next unit.
    fn blocked_for(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_classes() {
        assert!(RemoteError::CircuitBreakerTripped.is_process_fatal());
        assert!(RemoteError::AuthenticationRequired("x".into()).is_process_fatal());
        assert!(!RemoteError::Timeout("slow".into()).is_process_fatal());
        assert!(RemoteError::SymbolNotFound { symbol: "X".into() }.is_symbol_fatal());
        assert!(!RemoteError::Server { status: 502 }.is_symbol_fatal());
    }

    #[test]
    fn series_code_parses_from_toml() {
        #[derive(Deserialize)]
        struct Wrap {
            series: SeriesKind,
        }
        let w: Wrap = toml::from_str("series = \"BE\"").unwrap();
        assert_eq!(w.series, SeriesKind::TradeForTrade);
        assert_eq!(SeriesKind::default().to_string(), "EQ");
    }
}
