//! Error types for maxbackup-engine.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from engine operations.
///
/// Per-file copy failures are *classified into counters*, never propagated,
/// so this surface only covers setup problems.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An include/exclude pattern could not be compiled.
    #[error("invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),
}

/// Convenience constructor for [`EngineError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}
