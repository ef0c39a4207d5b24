//! Deterministic synthetic provider for offline dry runs.
//!
//! Produces a random walk per symbol and series, seeded from their names, so
//! the same (symbol, series, date) always yields the same row no matter how
//! the range is partitioned. Weekends are skipped. Clearly fake; never point a
//! production config at it.

use super::provider::{DataProvider, FetchRequest, RawBatch, RemoteError, SeriesKind};
use chrono::{Datelike, NaiveDate, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Default, Clone)]
pub struct SyntheticProvider;

impl SyntheticProvider {
    pub fn new() -> Self {
        Self
    }

    fn rng_for(symbol: &str, series: SeriesKind, date: NaiveDate) -> StdRng {
        let mut hasher = blake3::Hasher::new();
        hasher.update(symbol.as_bytes());
        hasher.update(series.code().as_bytes());
        hasher.update(&date.num_days_from_ce().to_le_bytes());
        StdRng::from_seed(*hasher.finalize().as_bytes())
    }

    /// A price level that drifts slowly with the date, so consecutive
    /// partitions join up without carrying state between calls.
    fn base_price(symbol: &str, date: NaiveDate) -> f64 {
        let seed = blake3::hash(symbol.as_bytes()).as_bytes()[0] as f64;
        let years = date.num_days_from_ce() as f64 / 365.25;
        (50.0 + seed) * (1.0 + 0.05 * (years / 3.0).sin())
    }
}

impl DataProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn fetch(&self, request: &FetchRequest) -> Result<RawBatch, RemoteError> {
        let mut batch = RawBatch::new(
            ["date", "open", "high", "low", "close", "volume"]
                .map(String::from)
                .to_vec(),
        );

        for date in request.start.iter_days().take_while(|d| *d <= request.end) {
            if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                continue;
            }
            let mut rng = Self::rng_for(&request.symbol, request.series, date);
            let open = Self::base_price(&request.symbol, date);
            let close = open * (1.0 + rng.gen_range(-0.03..0.03));
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
            let volume = rng.gen_range(500_000..5_000_000u64);

            batch.push_row(vec![
                date.format("%Y-%m-%d").to_string(),
                format!("{open:.2}"),
                format!("{high:.2}"),
                format!("{low:.2}"),
                format!("{close:.2}"),
                volume.to_string(),
            ]);
        }

        Ok(batch)
    }
}
