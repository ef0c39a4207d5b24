//! Progress tracking: the append-only progress log and the tracker that
//! combines it with the dataset store.
//!
//! The progress log is a human-readable activity trail, one event per line:
//!
//! ```text
//! 2024-05-01 10:00:00.123 - INFO - Processing symbol: RELIANCE
//! 2024-05-01 10:00:00.125 - INFO - Fetching RELIANCE from 2020-01-01 to 2020-12-31
//! 2024-05-01 10:00:01.410 - INFO - Confirmed RELIANCE through 2020-12-31
//! ```
//!
//! The watchdog reads it for two things only: the newest timestamp (liveness)
//! and the newest `Processing symbol:` line (resume hint). A `Finished run:`
//! line after it clears the hint, so the run after a complete one starts
//! from the top again. What is actually
//! stored is always answered by the dataset store, so a stale or truncated
//! log can delay work but never lose data.

use crate::data::store::{DatasetStore, StoreError};
use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Timestamp format at the start of each progress line.
pub const LINE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const PROCESSING_MARKER: &str = "Processing symbol: ";
const FINISHED_MARKER: &str = "Finished run: ";
const SEPARATOR: &str = " - ";

/// How much of the log end is read before falling back to a full scan.
const TAIL_BYTES: u64 = 64 * 1024;

/// One line's worth of worker activity.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    RunStarted {
        symbols: usize,
        resume_from: Option<String>,
    },
    ProcessingSymbol {
        symbol: String,
    },
    Fetching {
        symbol: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    Confirmed {
        symbol: String,
        through: NaiveDate,
    },
    UnitFailed {
        symbol: String,
        start: NaiveDate,
        end: NaiveDate,
        reason: String,
    },
    SymbolSkipped {
        symbol: String,
        reason: String,
        corrupt: bool,
    },
    /// Provider refuses requests; `seconds` left before the next attempt.
    Waiting {
        seconds: u64,
    },
    RunFinished {
        units: usize,
        rows_added: usize,
        failures: usize,
    },
}

impl ProgressEvent {
    pub fn level(&self) -> &'static str {
        match self {
            ProgressEvent::UnitFailed { .. } | ProgressEvent::Waiting { .. } => "WARNING",
            ProgressEvent::SymbolSkipped { corrupt: true, .. } => "ERROR",
            ProgressEvent::SymbolSkipped { .. } => "WARNING",
            _ => "INFO",
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::RunStarted {
                symbols,
                resume_from: Some(sym),
            } => write!(f, "Starting run over {symbols} symbols, resuming from {sym}"),
            ProgressEvent::RunStarted { symbols, .. } => {
                write!(f, "Starting run over {symbols} symbols")
            }
            ProgressEvent::ProcessingSymbol { symbol } => write!(f, "{PROCESSING_MARKER}{symbol}"),
            ProgressEvent::Fetching { symbol, start, end } => {
                write!(f, "Fetching {symbol} from {start} to {end}")
            }
            ProgressEvent::Confirmed { symbol, through } => {
                write!(f, "Confirmed {symbol} through {through}")
            }
            ProgressEvent::UnitFailed {
                symbol,
                start,
                end,
                reason,
            } => write!(f, "Failed {symbol} {start}..{end}: {reason}"),
            ProgressEvent::SymbolSkipped { symbol, reason, .. } => {
                write!(f, "Skipping {symbol} for this run: {reason}")
            }
            ProgressEvent::Waiting { seconds } => {
                write!(f, "Provider blocked, waiting {seconds}s before the next request")
            }
            ProgressEvent::RunFinished {
                units,
                rows_added,
                failures,
            } => write!(
                f,
                "{FINISHED_MARKER}{units} units, {rows_added} rows added, {failures} failures"
            ),
        }
    }
}

/// What the watchdog extracts from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogScan {
    /// Timestamp of the newest parseable line.
    pub last_activity: Option<NaiveDateTime>,
    /// Symbol of the newest `Processing symbol:` line, unless a run
    /// finished after it.
    pub last_symbol: Option<String>,
    /// The newest run-level line is a `Finished run:` line.
    pub run_finished: bool,
}

/// Split a progress line into (timestamp, level, message).
pub fn parse_line(line: &str) -> Option<(NaiveDateTime, &str, &str)> {
    let mut parts = line.splitn(3, SEPARATOR);
    let ts = parts.next()?;
    let level = parts.next()?;
    let message = parts.next()?;
    let ts = NaiveDateTime::parse_from_str(ts.trim(), LINE_TIME_FORMAT).ok()?;
    Some((ts, level.trim(), message.trim_end()))
}

fn scan_text(text: &str, scan: &mut LogScan) {
    for line in text.lines() {
        let Some((ts, _, message)) = parse_line(line) else {
            continue;
        };
        if scan.last_activity.map_or(true, |prev| ts >= prev) {
            scan.last_activity = Some(ts);
        }
        if let Some(sym) = message.strip_prefix(PROCESSING_MARKER) {
            let sym = sym.trim();
            if !sym.is_empty() {
                scan.last_symbol = Some(sym.to_string());
                scan.run_finished = false;
            }
        } else if message.starts_with(FINISHED_MARKER) {
            scan.last_symbol = None;
            scan.run_finished = true;
        }
    }
}

/// Append-only progress log file.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event stamped with the local wall clock.
    pub fn append(&self, event: &ProgressEvent) -> io::Result<()> {
        self.append_at(chrono::Local::now().naive_local(), event)
    }

    pub fn append_at(&self, at: NaiveDateTime, event: &ProgressEvent) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(
            file,
            "{}{SEPARATOR}{}{SEPARATOR}{event}",
            at.format(LINE_TIME_FORMAT),
            event.level()
        )?;
        file.flush()
    }

    /// Newest activity timestamp and newest processing symbol.
    ///
    /// Only the tail of the file is read unless it holds neither a processing
    /// line nor a finished run. A missing file is an empty scan.
    pub fn scan(&self) -> io::Result<LogScan> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LogScan::default()),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        let offset = len.saturating_sub(TAIL_BYTES);

        let mut scan = LogScan::default();
        scan_text(&read_from(&mut file, offset)?, &mut scan);

        if scan.last_symbol.is_none() && !scan.run_finished && offset > 0 {
            let mut full = LogScan::default();
            scan_text(&read_from(&mut file, 0)?, &mut full);
            scan.last_symbol = full.last_symbol;
            scan.run_finished = full.run_finished;
        }
        Ok(scan)
    }
}

/// Read from `offset` to EOF, dropping the first (possibly partial) line
/// when not starting at the beginning.
fn read_from(file: &mut File, offset: u64) -> io::Result<String> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf).into_owned();
    if offset == 0 {
        return Ok(text);
    }
    Ok(match text.find('\n') {
        Some(nl) => text[nl + 1..].to_string(),
        None => String::new(),
    })
}

/// Durable progress state: per-symbol coverage from the store, the
/// "current symbol" pointer from the progress log.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    store: DatasetStore,
    log: ProgressLog,
}

impl ProgressTracker {
    pub fn new(store: DatasetStore, log: ProgressLog) -> Self {
        Self { store, log }
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    pub fn log(&self) -> &ProgressLog {
        &self.log
    }

    /// Last confirmed date with data, straight from the store.
    pub fn current_for(&self, symbol: &str) -> Result<Option<NaiveDate>, StoreError> {
        self.store.max_date(symbol)
    }

    /// Record that `symbol` is stored through `last_date`.
    pub fn record(&self, symbol: &str, last_date: NaiveDate) -> io::Result<()> {
        self.log.append(&ProgressEvent::Confirmed {
            symbol: symbol.to_string(),
            through: last_date,
        })
    }

    /// Append any other activity line. Every call is a liveness heartbeat.
    pub fn heartbeat(&self, event: &ProgressEvent) -> io::Result<()> {
        self.log.append(event)
    }

    /// Symbol the last worker was processing, if the log says.
    pub fn resume_point(&self) -> Option<String> {
        match self.log.scan() {
            Ok(scan) => scan.last_symbol,
            Err(e) => {
                warn!(path = %self.log.path().display(), error = %e, "cannot read progress log");
                None
            }
        }
    }
}
