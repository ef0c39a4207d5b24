//! Remote sources, schema normalization, and the per-symbol dataset store.

pub mod circuit_breaker;
pub mod normalize;
pub mod provider;
pub mod record;
pub mod store;
pub mod synthetic;
pub mod universe;
pub mod yahoo;

pub use circuit_breaker::CircuitBreaker;
pub use normalize::{normalize_batch, NormalizeError};
pub use provider::{DataProvider, FetchRequest, RawBatch, RemoteError, SeriesKind};
pub use record::Record;
pub use store::{Coverage, DatasetStore, MergeOutcome, StoreError};
pub use synthetic::SyntheticProvider;
pub use universe::{Universe, UniverseError};
pub use yahoo::{YahooOptions, YahooProvider};
