//! Stockpile Core: supervised incremental ingestion of daily market data.
//!
//! - Remote providers behind the [`data::DataProvider`] trait (Yahoo chart
//!   API, deterministic synthetic source)
//! - Schema normalization into the fixed [`data::Record`] shape
//! - Per-symbol dataset store with idempotent, atomic merges
//! - Period planner that skips work the store already covers
//! - Fetch worker with per-unit failure containment and a progress log
//! - Watchdog that restarts a stalled or crashed worker from its resume point

pub mod config;
pub mod data;
pub mod logging;
pub mod pipeline;
pub mod supervisor;

pub use config::{ConfigError, PipelineConfig, ProviderKind};
