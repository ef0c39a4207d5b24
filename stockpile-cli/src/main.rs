//! Stockpile CLI: fetch worker, watchdog, and store inspection.
//!
//! Commands:
//! - `fetch`: one ingest run over the universe, resumable
//! - `watchdog`: supervise `fetch` subprocesses, restarting on crash or stall
//! - `status`: per-symbol coverage and the current resume hint
//! - `init-config`: write a default TOML config

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stockpile_core::data::{
    Coverage, DataProvider, DatasetStore, SyntheticProvider, Universe, YahooProvider,
};
use stockpile_core::logging::init_logging;
use stockpile_core::pipeline::{run_ingest, ProgressTracker, ResumeMode};
use stockpile_core::supervisor::{CommandLauncher, Supervisor};
use stockpile_core::{PipelineConfig, ProviderKind};
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "stockpile.toml";

#[derive(Parser)]
#[command(
    name = "stockpile",
    version,
    about = "Stockpile, supervised incremental market-data ingestion"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConfigArgs {
    /// TOML config file. Defaults to ./stockpile.toml when present.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

/// Where the run begins. At most one; none means from the start.
#[derive(Args)]
#[group(multiple = false)]
struct ResumeArgs {
    /// Start from the first symbol of the universe.
    #[arg(long)]
    start: bool,

    /// Resume from the symbol named in the progress log.
    #[arg(long)]
    resume: bool,

    /// Resume from an explicit symbol.
    #[arg(long, value_name = "SYMBOL")]
    resume_from: Option<String>,
}

impl ResumeArgs {
    fn mode(&self) -> ResumeMode {
        match (&self.resume_from, self.resume) {
            (Some(sym), _) => ResumeMode::From(sym.clone()),
            (None, true) => ResumeMode::FromLog,
            (None, false) => ResumeMode::Start,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every symbol's missing years and merge them into the store.
    Fetch {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        resume: ResumeArgs,

        /// Use the deterministic synthetic provider (offline dry run).
        #[arg(long, default_value_t = false)]
        synthetic: bool,
    },
    /// Run `fetch` under supervision, restarting it when it crashes or stalls.
    Watchdog {
        #[command(flatten)]
        config: ConfigArgs,

        /// First launch starts from the top instead of the progress log.
        #[arg(long, default_value_t = false)]
        fresh: bool,

        /// Pass --synthetic to the worker.
        #[arg(long, default_value_t = false)]
        synthetic: bool,
    },
    /// Show per-symbol coverage and the resume hint.
    Status {
        #[command(flatten)]
        config: ConfigArgs,

        /// Read every data file instead of the metadata sidecars.
        #[arg(long, default_value_t = false)]
        verify: bool,
    },
    /// Write a default config file.
    InitConfig {
        #[arg(long, short, default_value = DEFAULT_CONFIG)]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch {
            config,
            resume,
            synthetic,
        } => run_fetch(config.config.as_deref(), resume.mode(), synthetic),
        Commands::Watchdog {
            config,
            fresh,
            synthetic,
        } => run_watchdog(config.config.as_deref(), fresh, synthetic),
        Commands::Status { config, verify } => run_status(config.config.as_deref(), verify),
        Commands::InitConfig { output, force } => run_init_config(&output, force),
    }
}

/// Explicit path, else `./stockpile.toml` if it exists, else defaults.
fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => Ok(PipelineConfig::from_file(path)?),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            Ok(PipelineConfig::from_file(Path::new(DEFAULT_CONFIG))?)
        }
        None => {
            let config = PipelineConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn run_fetch(config_path: Option<&Path>, mode: ResumeMode, synthetic: bool) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging("worker", &config.paths.log_dir, &config.logging.level)?;

    let universe = Universe::from_file(&config.paths.universe)
        .with_context(|| format!("loading universe {}", config.paths.universe.display()))?;
    let range = config.date_range(chrono::Local::now().date_naive())?;
    let tracker = ProgressTracker::new(
        DatasetStore::new(&config.paths.data_dir),
        config.progress_log(),
    );

    let provider: Box<dyn DataProvider> =
        if synthetic || config.fetch.provider == ProviderKind::Synthetic {
            Box::new(SyntheticProvider::new())
        } else {
            Box::new(YahooProvider::new(
                config.yahoo_options(),
                Arc::new(config.circuit_breaker()),
            )?)
        };

    let summary = run_ingest(
        &universe,
        range,
        provider.as_ref(),
        &tracker,
        config.worker_options(),
        &mode,
    )?;

    println!(
        "Run complete: {} units, {} merged, {} rows added, {} failures",
        summary.units_attempted,
        summary.units_merged,
        summary.rows_added,
        summary.failures()
    );
    if !summary.abandoned_symbols.is_empty() {
        println!("Retry next run: {}", summary.abandoned_symbols.join(", "));
    }
    if !summary.corrupt_symbols.is_empty() {
        println!(
            "Corrupt stores (need manual repair): {}",
            summary.corrupt_symbols.join(", ")
        );
    }
    Ok(())
}

fn run_watchdog(config_path: Option<&Path>, fresh: bool, synthetic: bool) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging("watchdog", &config.paths.log_dir, &config.logging.level)?;

    let mut worker_args: Vec<OsString> = vec!["fetch".into()];
    if let Some(path) = config_path {
        worker_args.push("--config".into());
        worker_args.push(path.into());
    }
    if synthetic {
        worker_args.push("--synthetic".into());
    }

    let launcher = CommandLauncher::current_exe(worker_args)
        .context("locating the stockpile executable")?;
    let initial = if fresh {
        ResumeMode::Start
    } else {
        ResumeMode::FromLog
    };
    let watchdog = config.supervisor_config();
    info!(
        poll_secs = watchdog.poll_interval.as_secs(),
        stall_secs = watchdog.stall_timeout.as_secs(),
        progress_log = %config.progress_log().path().display(),
        "watchdog starting"
    );

    let mut supervisor = Supervisor::new(launcher, config.progress_log(), watchdog, initial);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(supervisor.run_until(shutdown_signal()))?;

    info!(restarts = supervisor.restarts(), "watchdog stopped");
    Ok(())
}

/// Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn run_status(config_path: Option<&Path>, verify: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let universe = Universe::from_file(&config.paths.universe)
        .with_context(|| format!("loading universe {}", config.paths.universe.display()))?;
    let store = DatasetStore::new(&config.paths.data_dir);
    let symbols = universe.to_vec();

    println!("Data dir: {}", store.data_dir().display());
    println!("Universe: {} symbols", universe.len());
    println!();
    println!("{:<16} {:<12} {:<12} {:>8}", "Symbol", "First", "Last", "Rows");
    println!("{}", "-".repeat(51));

    let mut stored = 0;
    let mut unreadable = 0;
    if verify {
        for sym in &symbols {
            match store.coverage(sym) {
                Coverage::Through { first, last, rows } => {
                    stored += 1;
                    println!(
                        "{:<16} {:<12} {:<12} {:>8}",
                        sym,
                        first.to_string(),
                        last.to_string(),
                        rows
                    );
                }
                Coverage::NotStored => println!("{:<16} {:<12} {:<12} {:>8}", sym, "-", "-", "-"),
                Coverage::Unreadable(reason) => {
                    unreadable += 1;
                    println!("{sym:<16} UNREADABLE: {reason}");
                }
            }
        }
    } else {
        for status in store.status(&symbols) {
            let fmt_date = |d: Option<chrono::NaiveDate>| {
                d.map_or_else(|| "-".to_string(), |d| d.to_string())
            };
            if status.stored {
                stored += 1;
            }
            println!(
                "{:<16} {:<12} {:<12} {:>8}",
                status.symbol,
                fmt_date(status.start_date),
                fmt_date(status.end_date),
                status
                    .row_count
                    .map_or_else(|| "-".to_string(), |n| n.to_string())
            );
        }
    }

    println!();
    println!("Stored: {stored}/{}", universe.len());
    if unreadable > 0 {
        println!("Unreadable: {unreadable}");
    }

    let scan = config.progress_log().scan()?;
    match (scan.last_symbol, scan.last_activity) {
        (Some(sym), Some(at)) => println!("Resume hint: {sym} (last activity {at})"),
        (Some(sym), None) => println!("Resume hint: {sym}"),
        (None, _) => println!("Resume hint: none (next run starts from the top)"),
    }
    Ok(())
}

fn run_init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }
    let text = PipelineConfig::default().to_toml()?;
    std::fs::write(output, text).with_context(|| format!("writing {}", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}
