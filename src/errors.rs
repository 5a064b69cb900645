//! Unified error types and result handling.
//!
//! Internal functions return [`Result`] and propagate with `?`. The public
//! component operations convert these errors into structured outcomes at
//! their boundary, so callers never see an `Err` from them.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Every failure the lifecycle manager can encounter internally.
#[derive(Debug, Error)]
pub enum Error {
    /// Settings or application configuration could not be read or is incomplete
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable description
        message: String,
    },

    /// Data store query or connection failure
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Filesystem failure tied to a specific path
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path being operated on
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// JSON encode/decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML decode failure
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Archive write failure
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Directory traversal failure
    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// No backup directory with this id
    #[error("Backup not found: {id}")]
    BackupNotFound {
        /// Requested backup id
        id: String,
    },

    /// Checksum mismatch or missing manifest; the backup must not be used
    #[error("Integrity check failed: {message}")]
    Integrity {
        /// What failed to verify
        message: String,
    },

    /// An external process exited non-zero or reported failure in its output
    #[error("{tool} failed: {output}")]
    ExternalTool {
        /// Program that was invoked
        tool: String,
        /// Captured stdout and stderr
        output: String,
    },

    /// Another backup/restore/reset currently holds the operation lock
    #[error("Another operation ({operation}) is in progress (pid {pid}, since {since})")]
    OperationInProgress {
        /// Operation recorded in the lock file
        operation: String,
        /// Process holding the lock
        pid: u32,
        /// When the lock was taken
        since: String,
    },

    /// The state document changed since the caller last read it
    #[error("State document was modified concurrently (expected revision {expected}, found {found})")]
    StateConflict {
        /// Revision the caller based its write on
        expected: u64,
        /// Revision currently stored
        found: u64,
    },

    /// Not enough free space on the backup volume
    #[error("Insufficient disk space: {required_mb} MB required, {available_mb} MB available")]
    InsufficientDiskSpace {
        /// Space needed
        required_mb: u64,
        /// Space free
        available_mb: u64,
    },
}

impl Error {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Shorthand for [`Error::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Integrity`].
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Whether the caller may simply try again later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StateConflict { .. } | Self::OperationInProgress { .. }
        )
    }
}

/// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;
