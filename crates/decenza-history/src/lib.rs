//! Shot history engine.
//!
//! Persists one record per extraction into SQLite (WAL journal mode,
//! foreign keys on): summary columns, a zlib-compressed time-series blob,
//! and ordered phase markers, with an FTS5 external-content index over the
//! searchable text columns.
//!
//! # Architecture
//!
//! - [`schema`]: table creation and versioned migrations (v1 → v7).
//! - [`store`]: synchronous operations on a single connection. Every
//!   worker opens its own connection; WAL gives readers a consistent
//!   snapshot during writes.
//! - [`query`]: the pure SQL builders (filter WHERE clauses, the FTS5
//!   query formatter, the sort-column whitelist).
//! - [`samples`]: the compressed sample blob codec and the weight-flow
//!   smoothing shared with migration v7.
//! - [`engine`]: the async facade. Blocking work runs on the blocking
//!   pool; completions are delivered as [`engine::HistoryEvent`]s and are
//!   safe against the engine being dropped mid-flight.
//! - [`debuglog`]: the bounded debug line buffer captured into a shot's
//!   `debug_log` column.

pub mod debuglog;
pub mod engine;
pub mod model;
pub mod query;
pub mod samples;
pub mod schema;
pub mod store;

pub use engine::{HistoryEvent, ShotHistory};
pub use model::{PhaseMarker, ShotFilter, ShotRecord, ShotSaveData, ShotSummary};
pub use samples::SampleSet;

/// Errors from the history engine.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// SQL failure; the surrounding operation rolled back.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Filesystem failure (snapshot copy, import source).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Sample blob failed to decompress or parse.
    #[error("sample blob error: {0}")]
    Blob(String),
    /// The import source is not a usable shots database.
    #[error("import error: {0}")]
    Import(String),
    /// Another exclusive operation (backup/import) is in flight.
    #[error("operation already in progress: {0}")]
    Busy(&'static str),
    /// A blocking worker died before reporting.
    #[error("{0}")]
    Worker(String),
}
