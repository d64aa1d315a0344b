//! Error taxonomy for the sync core.
//!
//! Per-file failures are captured into the report and never surface through
//! these types; only run-fatal conditions (bad configuration, scan failure,
//! unreadable state, cancellation) propagate as [`SyncError`].

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid configuration, rejected before the run starts.
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// Storage backend failure during a run-fatal operation (scan).
    #[error("{operation} failed for {path}: {source}")]
    Io {
        path: String,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The comparator could not reach a verdict for a file.
    #[error("comparison failed for {path}: {message}")]
    Comparison { path: String, message: String },

    /// Loading or saving the persisted sync state.
    #[error("sync state {path}: {message}")]
    State { path: PathBuf, message: String },

    /// Cooperative cancellation fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn state(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::State {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
