use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the service runtime, codec, and IPC server.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(#[from] maxbackup_core::CoreError),

    #[error("engine error: {0}")]
    Engine(#[from] maxbackup_engine::EngineError),

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("pipe protocol error: {0}")]
    Protocol(String),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// The peer closed the connection before the first byte of a frame.
    #[error("end of stream")]
    EndOfStream,
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ServiceError {
    ServiceError::Io {
        path: path.into(),
        source,
    }
}
