//! Domain types for the MaxBackup service.
//!
//! All filesystem path fields use `PathBuf`; never `&str` or `String` for
//! paths that are handed to the filesystem. Job `source`/`destination` stay
//! `String` until expansion because they may carry `~` and `%USERPROFILE%`
//! tokens that only make sense against a specific user's home.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::expand::{expand_json_text, expand_path};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque machine-scoped user identifier; primary key of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sid(pub String);

impl Sid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Sid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Sid {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Service state
// ---------------------------------------------------------------------------

/// One registered user, as persisted in the service state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistration {
    pub sid: Sid,
    /// Human-readable name; informational only.
    pub username: String,
    /// Absolute path to the user's backup configuration file.
    pub config_path: PathBuf,
    /// UTC timestamp of first registration.
    pub registered_at: DateTime<Utc>,
}

/// The durable daemon state: tunables plus the ordered registration list.
///
/// Registration order is not semantic but is preserved across save/load so
/// that state-file diffs stay deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default = "default_pipe_timeout_seconds")]
    pub pipe_timeout_seconds: u64,
    #[serde(default = "default_worker_shutdown_timeout_seconds")]
    pub worker_shutdown_timeout_seconds: u64,
    #[serde(default)]
    pub registered_users: Vec<UserRegistration>,
}

fn default_pipe_timeout_seconds() -> u64 {
    30
}

fn default_worker_shutdown_timeout_seconds() -> u64 {
    60
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pipe_timeout_seconds: default_pipe_timeout_seconds(),
            worker_shutdown_timeout_seconds: default_worker_shutdown_timeout_seconds(),
            registered_users: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn find_user(&self, sid: &Sid) -> Option<&UserRegistration> {
        self.registered_users.iter().find(|r| &r.sid == sid)
    }

    pub fn pipe_timeout(&self) -> Duration {
        Duration::from_secs(self.pipe_timeout_seconds.max(1))
    }

    pub fn worker_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_shutdown_timeout_seconds.max(1))
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Resolver output for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub display_name: String,
    pub home_directory: PathBuf,
}

// ---------------------------------------------------------------------------
// User backup configuration
// ---------------------------------------------------------------------------

/// One mirror operation inside a user's config file.
///
/// The wire casing is PascalCase (`Name`, `Source`, …); lowercase spellings
/// are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,
    #[serde(rename = "Source", alias = "source")]
    pub source: String,
    #[serde(rename = "Destination", alias = "destination")]
    pub destination: String,
    #[serde(rename = "Include", alias = "include")]
    pub include: Vec<String>,
    #[serde(rename = "Exclude", alias = "exclude", default)]
    pub exclude: Vec<String>,
}

impl BackupJob {
    /// Expand `source` against a home directory (plain mode).
    pub fn expanded_source(&self, home: &Path) -> PathBuf {
        PathBuf::from(expand_path(&self.source, home))
    }

    /// Expand `destination` against a home directory (plain mode).
    pub fn expanded_destination(&self, home: &Path) -> PathBuf {
        PathBuf::from(expand_path(&self.destination, home))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BackupSection {
    #[serde(rename = "Jobs", alias = "jobs", default)]
    pub jobs: Vec<BackupJob>,
}

/// Root of a user's backup configuration file.
///
/// Extra sections (e.g. a logging-sink block) are tolerated and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BackupConfig {
    #[serde(rename = "Backup", alias = "backup", default)]
    pub backup: BackupSection,
}

/// One field-level problem found while validating a user config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job: Option<String>,
    pub field: String,
    pub error: String,
}

impl BackupConfig {
    /// Parse raw JSON config text, expanding `~` / `%USERPROFILE%` tokens in
    /// the JSON source against `home` first so globs and paths resolve
    /// relative to the owning user even when the service has a different
    /// environment.
    pub fn from_json_text(text: &str, home: &Path) -> Result<Self, serde_json::Error> {
        let expanded = expand_json_text(text, home);
        serde_json::from_str(&expanded)
    }

    /// Parse and validate in one step, collapsing parse failures into the
    /// same error shape the IPC protocol carries.
    pub fn parse_and_validate(text: &str, home: &Path) -> Result<Self, Vec<ValidationError>> {
        let config = Self::from_json_text(text, home).map_err(|e| {
            vec![ValidationError {
                job: None,
                field: "JSON".to_string(),
                error: format!("Invalid JSON: {e}"),
            }]
        })?;
        let errors = config.validate(home);
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }

    /// Validate every job against a resolved home directory.
    ///
    /// Checks: non-empty unique names, at least one include pattern, expanded
    /// source/destination absolute, and destination not a proper ancestor of
    /// the source (mirroring into an ancestor would recurse into itself).
    pub fn validate(&self, home: &Path) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen_names: Vec<&str> = Vec::new();

        for job in &self.backup.jobs {
            let job_label = if job.name.is_empty() {
                None
            } else {
                Some(job.name.clone())
            };

            if job.name.is_empty() {
                errors.push(ValidationError {
                    job: None,
                    field: "Name".to_string(),
                    error: "job name must not be empty".to_string(),
                });
            } else if seen_names.contains(&job.name.as_str()) {
                errors.push(ValidationError {
                    job: job_label.clone(),
                    field: "Name".to_string(),
                    error: format!("duplicate job name '{}'", job.name),
                });
            } else {
                seen_names.push(job.name.as_str());
            }

            if job.include.is_empty() {
                errors.push(ValidationError {
                    job: job_label.clone(),
                    field: "Include".to_string(),
                    error: "at least one include pattern is required".to_string(),
                });
            }

            let source = job.expanded_source(home);
            let destination = job.expanded_destination(home);

            if !source.is_absolute() {
                errors.push(ValidationError {
                    job: job_label.clone(),
                    field: "Source".to_string(),
                    error: format!("source '{}' is not absolute after expansion", job.source),
                });
            }
            if !destination.is_absolute() {
                errors.push(ValidationError {
                    job: job_label.clone(),
                    field: "Destination".to_string(),
                    error: format!(
                        "destination '{}' is not absolute after expansion",
                        job.destination
                    ),
                });
            }
            if source != destination && source.starts_with(&destination) {
                errors.push(ValidationError {
                    job: job_label,
                    field: "Destination".to_string(),
                    error: format!(
                        "destination '{}' is an ancestor of source '{}'",
                        destination.display(),
                        source.display()
                    ),
                });
            }
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
