//! Period planner: which (symbol, sub-range) units a run should attempt.
//!
//! Units are grouped by symbol in universe order, and each symbol's range is
//! cut into calendar years clipped to the global range. Before a symbol's
//! units are produced the dataset store is consulted, so work that a
//! previous (possibly crashed) run already finished is never redone.

use crate::data::store::{Coverage, DatasetStore};
use crate::data::universe::Universe;
use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("date range is inverted: {start} > {end}")]
    InvertedRange { start: NaiveDate, end: NaiveDate },
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, PlanError> {
        if start > end {
            return Err(PlanError::InvertedRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Calendar-year partitions, each clipped to this range.
    pub fn yearly_partitions(&self) -> Vec<DateRange> {
        (self.start.year()..=self.end.year())
            .filter_map(|year| {
                let jan1 = NaiveDate::from_ymd_opt(year, 1, 1)?;
                let dec31 = NaiveDate::from_ymd_opt(year, 12, 31)?;
                Some(DateRange {
                    start: jan1.max(self.start),
                    end: dec31.min(self.end),
                })
            })
            .collect()
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// One fetch attempt: a symbol and an inclusive date range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchUnit {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl fmt::Display for FetchUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}..{}", self.symbol, self.start, self.end)
    }
}

pub struct Planner<'a> {
    universe: &'a Universe,
    range: DateRange,
    store: &'a DatasetStore,
}

impl<'a> Planner<'a> {
    pub fn new(universe: &'a Universe, range: DateRange, store: &'a DatasetStore) -> Self {
        Self {
            universe,
            range,
            store,
        }
    }

    /// Lazy unit sequence, starting at `resume_from` when it is part of the
    /// universe and at the first symbol otherwise.
    pub fn plan(&self, resume_from: Option<&str>) -> Plan<'a> {
        let symbols = self.universe.to_vec();
        let skip = match resume_from {
            Some(sym) => match self.universe.position(sym) {
                Some(pos) => {
                    debug!(symbol = sym, position = pos, "resuming plan");
                    pos
                }
                None => {
                    warn!(symbol = sym, "resume symbol not in universe, starting from the top");
                    0
                }
            },
            None => 0,
        };

        Plan {
            symbols: symbols.into_iter().skip(skip).collect(),
            range: self.range,
            store: self.store,
            pending: VecDeque::new(),
        }
    }
}

/// Iterator over planned units.
///
/// The store is read when the iterator first reaches a symbol, never ahead of
/// time, and iteration itself has no side effects.
pub struct Plan<'a> {
    symbols: VecDeque<&'a str>,
    range: DateRange,
    store: &'a DatasetStore,
    pending: VecDeque<FetchUnit>,
}

impl Plan<'_> {
    fn units_for(&self, symbol: &str) -> VecDeque<FetchUnit> {
        let covered_through = match self.store.coverage(symbol) {
            Coverage::Through { last, .. } => Some(last),
            Coverage::NotStored => None,
            Coverage::Unreadable(reason) => {
                // Planned as uncovered; the merge step reports the corruption.
                debug!(symbol, %reason, "store unreadable while planning");
                None
            }
        };

        unit_ranges(self.range, covered_through)
            .into_iter()
            .map(|r| FetchUnit {
                symbol: symbol.to_string(),
                start: r.start,
                end: r.end,
            })
            .collect()
    }
}

impl Iterator for Plan<'_> {
    type Item = FetchUnit;

    fn next(&mut self) -> Option<FetchUnit> {
        loop {
            if let Some(unit) = self.pending.pop_front() {
                return Some(unit);
            }
            let symbol = self.symbols.pop_front()?;
            self.pending = self.units_for(symbol);
            if self.pending.is_empty() {
                debug!(symbol, "already covered, skipping");
            }
        }
    }
}

/// Yearly partitions of `range` that still need fetching given the store
/// holds data through `covered_through`.
///
/// Units ending on or before that date are dropped; a partially covered unit
/// starts the day after it.
pub fn unit_ranges(range: DateRange, covered_through: Option<NaiveDate>) -> Vec<DateRange> {
    let partitions = range.yearly_partitions();
    let Some(last) = covered_through else {
        return partitions;
    };
    let Some(resume_at) = last.checked_add_days(Days::new(1)) else {
        return Vec::new();
    };

    partitions
        .into_iter()
        .filter(|p| p.end > last)
        .map(|p| DateRange {
            start: p.start.max(resume_at),
            end: p.end,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn inverted_range_rejected() {
        assert!(DateRange::new(d(2021, 1, 1), d(2020, 1, 1)).is_err());
    }

    #[test]
    fn partitions_are_clipped_years() {
        let r = DateRange::new(d(2019, 6, 15), d(2021, 2, 1)).unwrap();
        let parts = r.yearly_partitions();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], DateRange::new(d(2019, 6, 15), d(2019, 12, 31)).unwrap());
        assert_eq!(parts[1], DateRange::new(d(2020, 1, 1), d(2020, 12, 31)).unwrap());
        assert_eq!(parts[2], DateRange::new(d(2021, 1, 1), d(2021, 2, 1)).unwrap());
    }

    #[test]
    fn single_day_range_is_one_partition() {
        let r = DateRange::new(d(2020, 3, 3), d(2020, 3, 3)).unwrap();
        assert_eq!(r.yearly_partitions(), vec![r]);
    }

    #[test]
    fn covered_units_dropped_partial_unit_clipped() {
        let r = DateRange::new(d(2018, 1, 1), d(2021, 12, 31)).unwrap();
        let ranges = unit_ranges(r, Some(d(2020, 6, 30)));
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start(), d(2020, 7, 1));
        assert_eq!(ranges[1].start(), d(2021, 1, 1));
    }

    #[test]
    fn covered_through_year_end_skips_that_year() {
        let r = DateRange::new(d(2020, 1, 1), d(2021, 1, 10)).unwrap();
        let ranges = unit_ranges(r, Some(d(2020, 12, 31)));
        assert_eq!(ranges, vec![DateRange::new(d(2021, 1, 1), d(2021, 1, 10)).unwrap()]);
    }

    #[test]
    fn fully_covered_yields_nothing() {
        let r = DateRange::new(d(2020, 1, 1), d(2020, 12, 31)).unwrap();
        assert!(unit_ranges(r, Some(d(2021, 5, 1))).is_empty());
    }
}
