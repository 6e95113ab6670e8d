//! MaxBackup service runtime: per-user backup workers, the supervisor that
//! owns them, and the length-prefixed JSON IPC endpoint the CLI talks to.

mod error;

pub mod codec;
pub mod paths;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod supervisor;
pub mod worker;

pub use error::ServiceError;
pub use protocol::{PipeRequest, PipeResponse, RequestAction, ResponseStatus};
pub use runtime::{run, start_blocking};
pub use supervisor::Supervisor;
pub use worker::{UserWorker, WorkerIntervals, WorkerState};
