//! Backup and restore engine.
//!
//! Assembles consistent snapshots of every data domain (shot database,
//! settings, AI conversations, profiles, personal media) into a single
//! dated ZIP, on a daily schedule or on demand, and restores selected
//! domains in merge or replace mode.
//!
//! # Archive layout
//!
//! ```text
//! shots_backup_YYYYMMDD.zip
//!   shots_backup_YYYYMMDD.db     checkpointed SQLite snapshot
//!   settings.json                non-sensitive settings + ai_conversations
//!   profiles/user/*.json
//!   profiles/downloaded/*.json
//!   media/*                      personal media (catalog.json excluded)
//! ```
//!
//! The archive is assembled in a staging directory and atomically renamed
//! into place; a failed build never leaves a partial ZIP behind. Archives
//! older than 5 days are deleted, matched by the date in the filename.

pub mod archive;
pub mod engine;
pub mod schedule;

pub use engine::{BackupEngine, BackupEvent, RestoreOptions};
pub use schedule::should_backup_now;

/// Errors from backup and restore operations.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// ZIP read/write failure.
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    /// Shot database snapshot or import failure.
    #[error("history error: {0}")]
    History(#[from] decenza_history::HistoryError),
    /// Another backup or restore is already running.
    #[error("{0} already in progress")]
    Busy(&'static str),
    /// Restore accumulated one or more domain failures.
    #[error("{0}")]
    Restore(String),
}
