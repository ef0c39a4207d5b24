//! TOML pipeline configuration.
//!
//! Every field has a default, so a config file only needs the values that
//! differ. `stockpile init-config` writes the full default file.

use crate::data::provider::SeriesKind;
use crate::data::yahoo::YahooOptions;
use crate::data::CircuitBreaker;
use crate::pipeline::{DateRange, FailurePolicy, ProgressLog, WorkerOptions};
use crate::supervisor::SupervisorConfig;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Yahoo,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// CSV or TOML symbol list.
    pub universe: PathBuf,
    /// One `{SYMBOL}.csv` per symbol.
    pub data_dir: PathBuf,
    /// Progress log and component logs.
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            universe: PathBuf::from("universe.csv"),
            data_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    pub start: NaiveDate,
    /// Inclusive; today when unset.
    pub end: Option<NaiveDate>,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            start: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default(),
            end: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub provider: ProviderKind,
    pub series: SeriesKind,
    /// Exchange suffix for the remote symbol, e.g. `.NS`.
    pub symbol_suffix: String,
    pub request_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub http_retries: u32,
    pub failure_policy: FailurePolicy,
    pub breaker_cooldown_secs: u64,
    pub breaker_failure_threshold: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Yahoo,
            series: SeriesKind::Equity,
            symbol_suffix: ".NS".to_string(),
            request_delay_ms: 1000,
            http_timeout_secs: 30,
            http_retries: 0,
            failure_policy: FailurePolicy::SkipRemainingYears,
            breaker_cooldown_secs: 30 * 60,
            breaker_failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub poll_interval_secs: u64,
    pub stall_timeout_secs: u64,
    pub terminate_grace_secs: u64,
    pub restart_delay_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            stall_timeout_secs: 300,
            terminate_grace_secs: 10,
            restart_delay_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub range: RangeConfig,
    pub fetch: FetchConfig,
    pub watchdog: WatchdogConfig,
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.watchdog;
        if w.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.poll_interval_secs must be positive".into(),
            ));
        }

        // One unit can legitimately stay silent for this long.
        let worst_unit = self
            .yahoo_options()
            .worst_case_latency()
            .saturating_add(Duration::from_millis(self.fetch.request_delay_ms));
        if Duration::from_secs(w.stall_timeout_secs) <= worst_unit {
            return Err(ConfigError::Invalid(format!(
                "watchdog.stall_timeout_secs ({}s) must exceed one unit's worst-case latency \
                 ({}ms = http_timeout_secs x (http_retries + 1) + retry backoff + request_delay_ms)",
                w.stall_timeout_secs,
                worst_unit.as_millis()
            )));
        }

        if let Some(end) = self.range.end {
            if end < self.range.start {
                return Err(ConfigError::Invalid(format!(
                    "range.end {end} is before range.start {}",
                    self.range.start
                )));
            }
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.level is empty".into()));
        }
        Ok(())
    }

    /// Global range, with an unset end meaning `today`.
    pub fn date_range(&self, today: NaiveDate) -> Result<DateRange, ConfigError> {
        let end = self.range.end.unwrap_or(today);
        DateRange::new(self.range.start, end).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn progress_log(&self) -> ProgressLog {
        ProgressLog::new(self.paths.log_dir.join("progress.log"))
    }

    /// Where an open circuit breaker is remembered across worker restarts.
    pub fn breaker_state_file(&self) -> PathBuf {
        self.paths.log_dir.join("breaker.json")
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            request_delay: Duration::from_millis(self.fetch.request_delay_ms),
            failure_policy: self.fetch.failure_policy,
            series: self.fetch.series,
            // Several heartbeats per stall window while waiting out a block.
            heartbeat_interval: Duration::from_secs((self.watchdog.stall_timeout_secs / 4).max(1)),
        }
    }

    pub fn yahoo_options(&self) -> YahooOptions {
        YahooOptions {
            timeout: Duration::from_secs(self.fetch.http_timeout_secs),
            max_retries: self.fetch.http_retries,
            symbol_suffix: self.fetch.symbol_suffix.clone(),
            ..YahooOptions::default()
        }
    }

    pub fn circuit_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            Duration::from_secs(self.fetch.breaker_cooldown_secs),
            self.fetch.breaker_failure_threshold,
        )
        .with_state_file(self.breaker_state_file())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let w = &self.watchdog;
        SupervisorConfig {
            poll_interval: Duration::from_secs(w.poll_interval_secs),
            stall_timeout: Duration::from_secs(w.stall_timeout_secs),
            terminate_grace: Duration::from_secs(w.terminate_grace_secs),
            restart_delay: Duration::from_secs(w.restart_delay_secs),
        }
    }
}
