//! Error types for maxbackup-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (state file, user config).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The state-store retry budget was exhausted while the file stayed busy.
    #[error("timed out waiting for exclusive access to {path}")]
    Timeout { path: PathBuf },
}

/// Convenience constructor for [`CoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}
