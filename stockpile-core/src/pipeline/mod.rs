//! Incremental ingestion: plan units, fetch and merge them, report progress.

pub mod planner;
pub mod progress;
pub mod worker;

pub use planner::{DateRange, FetchUnit, PlanError, Planner};
pub use progress::{LogScan, ProgressEvent, ProgressLog, ProgressTracker};
pub use worker::{FailurePolicy, FetchWorker, RunSummary, UnitOutcome, WorkerError, WorkerOptions};

use crate::data::provider::DataProvider;
use crate::data::universe::Universe;
use tracing::info;

/// Where a worker run begins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// First symbol of the universe.
    #[default]
    Start,
    /// Symbol named by the newest `Processing symbol:` progress line.
    FromLog,
    /// An explicit symbol.
    From(String),
}

impl ResumeMode {
    /// Resolve to a concrete symbol, reading the progress log if needed.
    pub fn resolve(&self, tracker: &ProgressTracker) -> Option<String> {
        match self {
            ResumeMode::Start => None,
            ResumeMode::FromLog => tracker.resume_point(),
            ResumeMode::From(sym) => Some(sym.clone()),
        }
    }
}

/// One full worker run: plan against the store, fetch every pending unit,
/// and bracket the run with start/finish progress lines.
pub fn run_ingest(
    universe: &Universe,
    range: DateRange,
    provider: &dyn DataProvider,
    tracker: &ProgressTracker,
    options: WorkerOptions,
    resume: &ResumeMode,
) -> Result<RunSummary, WorkerError> {
    let resume_from = resume.resolve(tracker);
    info!(
        provider = provider.name(),
        symbols = universe.len(),
        %range,
        resume_from = resume_from.as_deref().unwrap_or("-"),
        "starting ingest run"
    );
    tracker.heartbeat(&ProgressEvent::RunStarted {
        symbols: universe.len(),
        resume_from: resume_from.clone(),
    })?;

    let planner = Planner::new(universe, range, tracker.store());
    let summary = FetchWorker::new(provider, tracker, options).run(planner.plan(resume_from.as_deref()))?;

    tracker.heartbeat(&ProgressEvent::RunFinished {
        units: summary.units_attempted,
        rows_added: summary.rows_added,
        failures: summary.failures(),
    })?;
    info!(
        units = summary.units_attempted,
        merged = summary.units_merged,
        rows_added = summary.rows_added,
        failures = summary.failures(),
        "ingest run finished"
    );
    Ok(summary)
}
