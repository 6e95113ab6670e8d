//! Durable service-state store.
//!
//! Persists [`ServiceConfig`] as pretty-printed JSON at `<root>/config.json`.
//! A single process-wide binary semaphore serializes every load and save;
//! `save_locked` is the internal path that assumes the semaphore is already
//! held, so `load` can write initial defaults without self-deadlock.
//!
//! Busy-file handling: individual filesystem steps are retried on
//! sharing-violation-class errors with exponential backoff starting at
//! 100 ms, doubling, capped at 1000 ms, within a 15 s wall-time budget.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{io_err, CoreError};
use crate::types::ServiceConfig;

const RETRY_INITIAL: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_millis(1000);
const RETRY_BUDGET: Duration = Duration::from_secs(15);

/// Returns `<root>/config.json` without touching the filesystem.
pub fn state_path_at(root: &Path) -> PathBuf {
    root.join("config.json")
}

/// The service-state store. All access to the on-disk file goes through one
/// instance of this type; no other component opens the file.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    guard: Mutex<()>,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> PathBuf {
        state_path_at(&self.root)
    }

    /// Load the service state. If the file does not exist yet, a state file
    /// containing defaults is created and those defaults are returned.
    pub async fn load(&self) -> Result<ServiceConfig, CoreError> {
        let _held = self.guard.lock().await;
        let path = self.path();
        if !path.exists() {
            let config = ServiceConfig::default();
            self.save_locked(&config).await?;
            return Ok(config);
        }
        let bytes = read_with_retry(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Persist the service state, overwriting the previous file.
    pub async fn save(&self, config: &ServiceConfig) -> Result<(), CoreError> {
        let _held = self.guard.lock().await;
        self.save_locked(config).await
    }

    /// Write the state file. Caller holds the store semaphore.
    ///
    /// The write goes to a `.tmp` sibling and is renamed into place, so the
    /// overwrite is atomic from the caller's point of view.
    async fn save_locked(&self, config: &ServiceConfig) -> Result<(), CoreError> {
        if !self.root.exists() {
            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|e| io_err(&self.root, e))?;
        }
        let path = self.path();
        let tmp = path.with_file_name("config.json.tmp");
        let json = serde_json::to_vec_pretty(config)?;
        write_with_retry(&path, &tmp, &json).await
    }
}

async fn read_with_retry(path: &Path) -> Result<Vec<u8>, CoreError> {
    let started = Instant::now();
    let mut delay = RETRY_INITIAL;
    loop {
        match tokio::fs::read(path).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) if is_sharing_violation(&err) => {
                if started.elapsed() + delay > RETRY_BUDGET {
                    return Err(CoreError::Timeout {
                        path: path.to_path_buf(),
                    });
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_CAP);
            }
            Err(err) => return Err(io_err(path, err)),
        }
    }
}

async fn write_with_retry(path: &Path, tmp: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    let started = Instant::now();
    let mut delay = RETRY_INITIAL;
    loop {
        let attempt = async {
            tokio::fs::write(tmp, bytes).await?;
            tokio::fs::rename(tmp, path).await
        };
        match attempt.await {
            Ok(()) => return Ok(()),
            Err(err) if is_sharing_violation(&err) => {
                if started.elapsed() + delay > RETRY_BUDGET {
                    let _ = tokio::fs::remove_file(tmp).await;
                    return Err(CoreError::Timeout {
                        path: path.to_path_buf(),
                    });
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_CAP);
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(tmp).await;
                return Err(io_err(path, err));
            }
        }
    }
}

/// Classify errors that mean "the file is busy, try again shortly".
///
/// Also used by the mirror engine to tell an in-use source file apart from a
/// hard copy failure.
pub fn is_sharing_violation(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    match err.raw_os_error() {
        // EBUSY / ETXTBSY on Unix, ERROR_SHARING_VIOLATION on Windows.
        Some(code) => {
            if cfg!(windows) {
                code == 32
            } else {
                code == 16 || code == 26
            }
        }
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use tempfile::TempDir;

    use crate::types::{Sid, UserRegistration};

    fn registration(sid: &str) -> UserRegistration {
        UserRegistration {
            sid: Sid::from(sid),
            username: sid.to_lowercase(),
            config_path: PathBuf::from("/tmp/cfg.json"),
            registered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn first_load_creates_file_with_defaults() {
        let root = TempDir::new().expect("root");
        let store = Store::new(root.path());

        let config = store.load().await.expect("load");
        assert_eq!(config, ServiceConfig::default());
        assert!(store.path().exists(), "state file should be created");

        let again = store.load().await.expect("second load");
        assert_eq!(again, config);
    }

    #[tokio::test]
    async fn save_then_load_roundtrips_and_preserves_order() {
        let root = TempDir::new().expect("root");
        let store = Store::new(root.path());

        let config = ServiceConfig {
            registered_users: vec![
                registration("S-9"),
                registration("S-1"),
                registration("S-5"),
            ],
            ..ServiceConfig::default()
        };
        store.save(&config).await.expect("save");

        let loaded = store.load().await.expect("load");
        let sids: Vec<&str> = loaded
            .registered_users
            .iter()
            .map(|r| r.sid.as_str())
            .collect();
        assert_eq!(sids, vec!["S-9", "S-1", "S-5"]);
    }

    #[tokio::test]
    async fn state_file_is_pretty_printed() {
        let root = TempDir::new().expect("root");
        let store = Store::new(root.path());
        store.load().await.expect("load creates defaults");

        let text = std::fs::read_to_string(store.path()).expect("read");
        assert!(text.contains('\n'), "state file should be pretty-printed");
        assert!(text.contains("\"pipeTimeoutSeconds\": 30"));
    }

    #[tokio::test]
    async fn tmp_file_is_cleaned_up_after_save() {
        let root = TempDir::new().expect("root");
        let store = Store::new(root.path());
        store.save(&ServiceConfig::default()).await.expect("save");
        assert!(!store.path().with_file_name("config.json.tmp").exists());
    }

    #[tokio::test]
    async fn concurrent_loads_on_fresh_store_all_see_defaults() {
        let root = TempDir::new().expect("root");
        let store = Arc::new(Store::new(root.path()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.load().await }));
        }
        for handle in handles {
            let config = handle.await.expect("join").expect("load");
            assert_eq!(config, ServiceConfig::default());
        }
    }

    #[test]
    fn sharing_violation_classification() {
        assert!(is_sharing_violation(&io::Error::from(
            io::ErrorKind::WouldBlock
        )));
        #[cfg(unix)]
        assert!(is_sharing_violation(&io::Error::from_raw_os_error(16)));
        assert!(!is_sharing_violation(&io::Error::from(
            io::ErrorKind::NotFound
        )));
    }
}
