//! Unified error handling for the review workflow and its stores.
//!
//! Hard failures are [`ReviewError`]s and leave the session untouched.
//! Outcomes that degrade but do not abort an operation are [`Warning`]s,
//! returned next to the otherwise successful state.

use serde::Serialize;
use thiserror::Error;

/// Unified error type for review operations.
#[derive(Debug, Error)]
pub enum ReviewError {
    /// Input folder could not be listed or a queued file could not be read
    #[error("Input source '{path}' unavailable: {message}")]
    SourceUnavailable { path: String, message: String },

    /// Requested day is not in the current queue
    #[error("No tracks queued for day '{day}'")]
    DayNotFound { day: String },

    /// Stage handler invoked in a stage that has none
    #[error("No handler for stage {stage}")]
    InvalidStage { stage: String },

    /// Database or external service unreachable
    #[error("{service} unavailable: {message}")]
    UpstreamUnavailable { service: String, message: String },

    /// Track (usually client edits) breaks a structural invariant
    #[error("Invalid track: {message}")]
    InvalidTrack { message: String },

    /// The external track engine reported a failure
    #[error("Track engine error: {message}")]
    TrackEngine { message: String },

    /// Geometry store error
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Geometry store failures, split so callers can tell "not configured"
/// apart from "unreachable" apart from "query failed".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no database configured")]
    NotConfigured,

    #[error("database unreachable: {message}")]
    Unreachable { message: String },

    #[error("query failed: {0}")]
    QueryFailed(#[from] rusqlite::Error),

    #[error("schema migration failed: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("geometry codec error: {message}")]
    Codec { message: String },
}

/// Result type alias for review operations.
pub type Result<T> = std::result::Result<T, ReviewError>;

/// Result type alias for geometry store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Non-fatal outcome reported alongside a successful state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// The store step ran without a usable database; nothing was persisted
    PersistenceSkipped { reason: String },
    /// A raw file could not be moved to the backup folder
    BackupFailed { file: String, message: String },
    /// A trip or annotation export could not be written
    ExportFailed { path: String, message: String },
    /// A queued day could not be parsed and was passed over
    DayUnreadable { day: String, message: String },
}

/// Extension trait for converting Option to ReviewError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a day-not-found error.
    fn ok_or_day_not_found(self, day: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_day_not_found(self, day: &str) -> Result<T> {
        self.ok_or_else(|| ReviewError::DayNotFound {
            day: day.to_string(),
        })
    }
}
