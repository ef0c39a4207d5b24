//! Symbol universe: the set of symbols a run covers.
//!
//! Loaded once per run from either
//! - a CSV symbol list (first column, one header row), or
//! - a TOML file with a flat `symbols = [...]` list and/or sector tables.
//!
//! Symbols are trimmed and deduplicated. Iteration is lexicographic so the
//! position of a resume symbol means the same thing on every run.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("read universe file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse universe CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("parse universe TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid symbol '{0}': must be non-empty and contain no path separators")]
    InvalidSymbol(String),

    #[error("universe is empty")]
    Empty,
}

/// TOML layout: either a flat list, sector tables, or both.
#[derive(Debug, Default, Serialize, Deserialize)]
struct UniverseFile {
    #[serde(default)]
    symbols: Vec<String>,
    #[serde(default)]
    sectors: BTreeMap<String, Vec<String>>,
}

/// Ordered, deduplicated symbol set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Universe {
    symbols: BTreeSet<String>,
}

impl Universe {
    /// Build from any iterator of raw symbols. Blank entries are dropped.
    pub fn from_symbols<I, S>(symbols: I) -> Result<Self, UniverseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for raw in symbols {
            let sym = raw.as_ref().trim();
            if sym.is_empty() {
                continue;
            }
            validate_symbol(sym)?;
            set.insert(sym.to_string());
        }
        if set.is_empty() {
            return Err(UniverseError::Empty);
        }
        Ok(Self { symbols: set })
    }

    /// Load by extension: `.toml` as TOML, anything else as CSV.
    pub fn from_file(path: &Path) -> Result<Self, UniverseError> {
        let content = std::fs::read_to_string(path).map_err(|source| UniverseError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_csv(&content),
        }
    }

    /// First column of a CSV with a header row.
    pub fn from_csv(content: &str) -> Result<Self, UniverseError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(content.as_bytes());
        let mut raw = Vec::new();
        for row in reader.records() {
            if let Some(first) = row?.get(0) {
                raw.push(first.to_string());
            }
        }
        Self::from_symbols(raw)
    }

    pub fn from_toml(content: &str) -> Result<Self, UniverseError> {
        let file: UniverseFile = toml::from_str(content)?;
        let all = file
            .symbols
            .into_iter()
            .chain(file.sectors.into_values().flatten());
        Self::from_symbols(all)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(String::as_str)
    }

    /// Symbols in iteration order.
    pub fn to_vec(&self) -> Vec<&str> {
        self.iter().collect()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    /// Index of `symbol` in iteration order.
    pub fn position(&self, symbol: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s == symbol)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

fn validate_symbol(sym: &str) -> Result<(), UniverseError> {
    if sym.contains(['/', '\\']) || sym.contains("..") || sym.chars().any(char::is_control) {
        return Err(UniverseError::InvalidSymbol(sym.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_first_column_deduped_and_sorted() {
        let csv = "underlying_symbol,extra\nZEEL,x\n RELIANCE ,y\n,z\nZEEL,w\nM&M,v\n";
        let u = Universe::from_csv(csv).unwrap();
        assert_eq!(u.to_vec(), vec!["M&M", "RELIANCE", "ZEEL"]);
    }

    #[test]
    fn toml_flat_and_sectors_merge() {
        let toml = r#"
            symbols = ["TCS", "INFY"]
            [sectors]
            Banks = ["HDFCBANK", "TCS"]
        "#;
        let u = Universe::from_toml(toml).unwrap();
        assert_eq!(u.len(), 3);
        assert_eq!(u.position("INFY"), Some(1));
        assert!(u.contains("HDFCBANK"));
    }

    #[test]
    fn path_like_symbols_rejected() {
        assert!(matches!(
            Universe::from_symbols(["../etc"]),
            Err(UniverseError::InvalidSymbol(_))
        ));
    }

    #[test]
    fn empty_universe_rejected() {
        assert!(matches!(
            Universe::from_csv("symbol\n\n"),
            Err(UniverseError::Empty)
        ));
    }
}
