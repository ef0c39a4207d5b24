//! Fetch worker: pulls planned units one at a time, merges them into the
//! dataset store, and reports progress.
//!
//! Per-unit and per-symbol failures are contained here. Only conditions that
//! make further progress in this process impossible escape as
//! [`WorkerError`]; the watchdog restarts the process when that happens.

use super::planner::FetchUnit;
use super::progress::{ProgressEvent, ProgressTracker};
use crate::data::normalize::{normalize_batch, NormalizeError};
use crate::data::provider::{DataProvider, FetchRequest, RemoteError, SeriesKind};
use crate::data::store::{MergeOutcome, StoreError};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// What a failed unit (remote failure or malformed response) means for the
/// rest of its symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// A failed year abandons the symbol's later years for this run, so the
    /// store's max date stays before the gap and the next run refetches it.
    #[default]
    SkipRemainingYears,
    /// Later years are still attempted after a failed one. Once a later year
    /// merges, the planner treats the failed year as covered and never
    /// refetches it; the gap stays until filled by hand.
    ContinueLaterYears,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Pause between consecutive remote requests.
    pub request_delay: Duration,
    pub failure_policy: FailurePolicy,
    pub series: SeriesKind,
    /// Progress-line cadence while waiting for a blocked provider.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_secs(1),
            failure_policy: FailurePolicy::default(),
            series: SeriesKind::default(),
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

/// Process-fatal worker failures.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("cannot write progress log: {0}")]
    ProgressLog(#[from] io::Error),

    #[error("provider refuses further requests: {0}")]
    ProviderBlocked(RemoteError),

    #[error("dataset store failure: {0}")]
    Store(StoreError),
}

/// Classified result of one unit.
#[derive(Debug)]
pub enum UnitOutcome {
    Merged(MergeOutcome),
    /// Transport or remote failure; retried on a later run.
    Remote(RemoteError),
    /// Response could not be mapped to records.
    Malformed(NormalizeError),
    /// Existing store is unreadable; the symbol needs an operator.
    CorruptStore(StoreError),
}

/// Counters for one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub units_attempted: usize,
    pub units_merged: usize,
    pub rows_added: usize,
    pub remote_failures: usize,
    pub malformed: usize,
    pub abandoned_symbols: Vec<String>,
    pub corrupt_symbols: Vec<String>,
}

impl RunSummary {
    pub fn failures(&self) -> usize {
        self.remote_failures + self.malformed + self.corrupt_symbols.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures() == 0
    }
}

pub struct FetchWorker<'a> {
    provider: &'a dyn DataProvider,
    tracker: &'a ProgressTracker,
    options: WorkerOptions,
}

impl<'a> FetchWorker<'a> {
    pub fn new(
        provider: &'a dyn DataProvider,
        tracker: &'a ProgressTracker,
        options: WorkerOptions,
    ) -> Self {
        Self {
            provider,
            tracker,
            options,
        }
    }

    /// Work through `units` sequentially.
    pub fn run<I>(&self, units: I) -> Result<RunSummary, WorkerError>
    where
        I: IntoIterator<Item = FetchUnit>,
    {
        let mut summary = RunSummary::default();
        let mut current: Option<String> = None;
        let mut abandoned: Option<String> = None;

        for unit in units {
            if abandoned.as_deref() == Some(unit.symbol.as_str()) {
                debug!(%unit, "skipping unit of abandoned symbol");
                continue;
            }
            if current.as_deref() != Some(unit.symbol.as_str()) {
                info!(symbol = %unit.symbol, "processing symbol");
                self.tracker.heartbeat(&ProgressEvent::ProcessingSymbol {
                    symbol: unit.symbol.clone(),
                })?;
                current = Some(unit.symbol.clone());
            }
            if summary.units_attempted > 0 && !self.options.request_delay.is_zero() {
                std::thread::sleep(self.options.request_delay);
            }
            while let Some(wait) = self.provider.blocked_for().filter(|w| !w.is_zero()) {
                self.wait_out_block(wait)?;
            }

            summary.units_attempted += 1;
            self.tracker.heartbeat(&ProgressEvent::Fetching {
                symbol: unit.symbol.clone(),
                start: unit.start,
                end: unit.end,
            })?;

            match self.process(&unit)? {
                UnitOutcome::Merged(outcome) => {
                    summary.units_merged += 1;
                    summary.rows_added += outcome.added;
                    info!(
                        %unit,
                        added = outcome.added,
                        total = outcome.total,
                        "merged"
                    );
                    if let Some(last) = outcome.last_date {
                        self.tracker.record(&unit.symbol, last)?;
                    }
                }
                UnitOutcome::Remote(e) => {
                    summary.remote_failures += 1;
                    warn!(%unit, error = %e, "fetch failed, unit left for the next run");
                    let reason = e.to_string();
                    self.fail_unit(&unit, &reason)?;
                    if e.is_symbol_fatal() || self.skips_rest_of_symbol() {
                        self.abandon(&unit.symbol, &reason, false, &mut summary)?;
                        abandoned = Some(unit.symbol.clone());
                    }
                }
                UnitOutcome::Malformed(e) => {
                    summary.malformed += 1;
                    warn!(%unit, error = %e, "malformed response, unit skipped");
                    let reason = format!("malformed response: {e}");
                    self.fail_unit(&unit, &reason)?;
                    if self.skips_rest_of_symbol() {
                        self.abandon(&unit.symbol, &reason, false, &mut summary)?;
                        abandoned = Some(unit.symbol.clone());
                    }
                }
                UnitOutcome::CorruptStore(e) => {
                    error!(symbol = %unit.symbol, error = %e, "corrupt store, symbol needs manual repair");
                    self.abandon(&unit.symbol, &e.to_string(), true, &mut summary)?;
                    abandoned = Some(unit.symbol.clone());
                }
            }
        }

        Ok(summary)
    }

    /// Fetch, normalize and merge one unit.
    pub fn process(&self, unit: &FetchUnit) -> Result<UnitOutcome, WorkerError> {
        let request = FetchRequest {
            symbol: unit.symbol.clone(),
            start: unit.start,
            end: unit.end,
            series: self.options.series,
        };

        let batch = match self.provider.fetch(&request) {
            Ok(batch) => batch,
            Err(e) if e.is_process_fatal() => return Err(WorkerError::ProviderBlocked(e)),
            Err(e) => return Ok(UnitOutcome::Remote(e)),
        };

        let mut records = match normalize_batch(&batch) {
            Ok(records) => records,
            Err(e) => return Ok(UnitOutcome::Malformed(e)),
        };
        // Rows outside the unit would move the store's max date past ranges
        // that were never fetched.
        let before = records.len();
        records.retain(|r| r.date >= unit.start && r.date <= unit.end);
        if records.len() != before {
            debug!(%unit, dropped = before - records.len(), "dropped rows outside unit range");
        }

        match self.tracker.store().merge(&unit.symbol, &records) {
            Ok(outcome) => Ok(UnitOutcome::Merged(outcome)),
            Err(e) if e.is_corrupt() => Ok(UnitOutcome::CorruptStore(e)),
            Err(e) => Err(WorkerError::Store(e)),
        }
    }

    fn skips_rest_of_symbol(&self) -> bool {
        match self.options.failure_policy {
            FailurePolicy::SkipRemainingYears => true,
            FailurePolicy::ContinueLaterYears => {
                warn!("continuing past a failed unit; it will not be refetched once a later unit merges");
                false
            }
        }
    }

    fn fail_unit(&self, unit: &FetchUnit, reason: &str) -> Result<(), WorkerError> {
        self.tracker.heartbeat(&ProgressEvent::UnitFailed {
            symbol: unit.symbol.clone(),
            start: unit.start,
            end: unit.end,
            reason: reason.to_string(),
        })?;
        Ok(())
    }

    /// Sleep through a provider block, writing a progress line at least
    /// every `heartbeat_interval` so the watchdog sees a live worker.
    fn wait_out_block(&self, wait: Duration) -> Result<(), WorkerError> {
        warn!(
            provider = self.provider.name(),
            wait_secs = wait.as_secs(),
            "provider blocked, waiting out the cooldown"
        );
        let step = self.options.heartbeat_interval.max(Duration::from_millis(1));
        let mut remaining = wait;
        while !remaining.is_zero() {
            self.tracker.heartbeat(&ProgressEvent::Waiting {
                seconds: remaining.as_secs(),
            })?;
            let nap = remaining.min(step);
            std::thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
        Ok(())
    }

    fn abandon(
        &self,
        symbol: &str,
        reason: &str,
        corrupt: bool,
        summary: &mut RunSummary,
    ) -> Result<(), WorkerError> {
        if corrupt {
            summary.corrupt_symbols.push(symbol.to_string());
        } else {
            summary.abandoned_symbols.push(symbol.to_string());
        }
        self.tracker.heartbeat(&ProgressEvent::SymbolSkipped {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
            corrupt,
        })?;
        Ok(())
    }
}
