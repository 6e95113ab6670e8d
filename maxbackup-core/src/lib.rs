//! Shared domain model for the MaxBackup service: registrations, service
//! state, user identity resolution, and home-directory path expansion.

pub mod error;
pub mod expand;
pub mod identity;
pub mod store;
pub mod types;

pub use error::CoreError;
pub use expand::{expand_json_text, expand_path};
pub use identity::{IdentityResolver, OsIdentityResolver, StaticResolver};
pub use store::{is_sharing_violation, state_path_at, Store};
pub use types::{
    BackupConfig, BackupJob, Identity, ServiceConfig, Sid, UserRegistration, ValidationError,
};
