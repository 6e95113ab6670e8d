//! Mirror engine: enumerate a job's files by glob, copy what changed, and
//! account for what happened. Also home of the rolling file log shared by
//! per-user workers and the service itself.

pub mod error;
pub mod joblog;
pub mod mirror;

pub use error::EngineError;
pub use joblog::RollingLog;
pub use mirror::{format_bytes, run_job, JobSummary};
