//! Per-user backup worker.
//!
//! One worker per registered user: it owns the user's rolling log sink,
//! watches the user's config file for changes, and drives the mirror engine
//! in a loop. Workers hold no reference back to the supervisor; they receive
//! only a cancellation token and their log sink.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use maxbackup_core::{BackupConfig, UserRegistration};
use maxbackup_engine::{run_job, RollingLog};

use crate::error::ServiceError;

/// Directory under a user's home that holds the worker's rolling logs.
const USER_LOG_DIR: &str = ".max/logs";
const USER_LOG_PREFIX: &str = "backup-";
const USER_LOG_RETAIN: usize = 7;

/// Changes to the config file are coalesced within this window.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Lifecycle of a worker. `Stopping` is only entered through the shutdown
/// signal and `Stopped` is terminal; there is no paused state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Loop pacing. The defaults match production behavior; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct WorkerIntervals {
    /// Pause between backup cycles.
    pub cycle: Duration,
    /// Pause after a cycle that raised an error.
    pub error_backoff: Duration,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            cycle: Duration::from_secs(10),
            error_backoff: Duration::from_secs(60),
        }
    }
}

/// A running per-user worker, owned exclusively by the supervisor.
pub struct UserWorker {
    registration: UserRegistration,
    home: PathBuf,
    cancel: CancellationToken,
    state_rx: watch::Receiver<WorkerState>,
    handle: JoinHandle<()>,
    // Dropping the watcher stops config-change delivery, so it lives here.
    _watcher: RecommendedWatcher,
}

impl UserWorker {
    /// Start a worker with production pacing.
    pub fn spawn(
        registration: UserRegistration,
        home: PathBuf,
        cancel: CancellationToken,
    ) -> Result<Self, ServiceError> {
        Self::spawn_with(registration, home, cancel, WorkerIntervals::default())
    }

    /// Start a worker with explicit pacing.
    pub fn spawn_with(
        registration: UserRegistration,
        home: PathBuf,
        cancel: CancellationToken,
        intervals: WorkerIntervals,
    ) -> Result<Self, ServiceError> {
        let log = Arc::new(RollingLog::open(
            home.join(USER_LOG_DIR),
            USER_LOG_PREFIX,
            USER_LOG_RETAIN,
        )?);
        let (config_rx, watcher) = spawn_config_source(
            registration.config_path.clone(),
            home.clone(),
            log.clone(),
            cancel.clone(),
        )?;
        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
        let handle = tokio::spawn(run_loop(
            registration.clone(),
            home.clone(),
            log,
            config_rx,
            cancel.clone(),
            state_tx,
            intervals,
        ));
        Ok(Self {
            registration,
            home,
            cancel,
            state_rx,
            handle,
            _watcher: watcher,
        })
    }

    pub fn registration(&self) -> &UserRegistration {
        &self.registration
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn state(&self) -> WorkerState {
        if self.handle.is_finished() {
            WorkerState::Stopped
        } else {
            *self.state_rx.borrow()
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal shutdown and wait up to `deadline` for the loop to finish the
    /// file it is on and exit. A worker that overstays is aborted.
    pub async fn stop(mut self, deadline: Duration) {
        self.cancel.cancel();
        match tokio::time::timeout(deadline, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(sid = %self.registration.sid, error = %err, "worker task join failed");
            }
            Err(_) => {
                tracing::warn!(
                    sid = %self.registration.sid,
                    "worker did not stop within {}s, aborting",
                    deadline.as_secs()
                );
                self.handle.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config source
// ---------------------------------------------------------------------------

/// Build a watch channel that re-emits the parsed config on each disk
/// change, debounced. Reload failures keep the previous snapshot.
fn spawn_config_source(
    config_path: PathBuf,
    home: PathBuf,
    log: Arc<RollingLog>,
    cancel: CancellationToken,
) -> Result<(watch::Receiver<Arc<BackupConfig>>, RecommendedWatcher), ServiceError> {
    let initial = match std::fs::read_to_string(&config_path) {
        Ok(text) => match BackupConfig::from_json_text(&text, &home) {
            Ok(config) => config,
            Err(err) => {
                log.warn(format!(
                    "cannot parse {}: {err}; starting with no jobs",
                    config_path.display()
                ));
                BackupConfig::default()
            }
        },
        Err(err) => {
            log.warn(format!(
                "cannot read {}: {err}; starting with no jobs",
                config_path.display()
            ));
            BackupConfig::default()
        }
    };
    let (config_tx, config_rx) = watch::channel(Arc::new(initial));

    let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    // Watch the parent directory: editors replace config files wholesale.
    let watch_root = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_path.clone());
    watcher.watch(&watch_root, RecursiveMode::NonRecursive)?;

    tokio::spawn(reload_task(config_path, home, log, config_tx, event_rx, cancel));
    Ok((config_rx, watcher))
}

async fn reload_task(
    config_path: PathBuf,
    home: PathBuf,
    log: Arc<RollingLog>,
    config_tx: watch::Sender<Arc<BackupConfig>>,
    mut event_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    cancel: CancellationToken,
) {
    let mut last_reload: Option<Instant> = None;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                event
            }
        };
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "config watcher event error");
                continue;
            }
        };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        if !event
            .paths
            .iter()
            .any(|path| path.file_name() == config_path.file_name())
        {
            continue;
        }
        let now = Instant::now();
        if let Some(seen) = last_reload {
            if now.duration_since(seen) < RELOAD_DEBOUNCE {
                continue;
            }
        }
        last_reload = Some(now);

        match tokio::fs::read_to_string(&config_path).await {
            Ok(text) => match BackupConfig::from_json_text(&text, &home) {
                Ok(config) => {
                    log.info(format!(
                        "configuration reloaded ({} jobs)",
                        config.backup.jobs.len()
                    ));
                    let _ = config_tx.send(Arc::new(config));
                }
                Err(err) => {
                    log.warn(format!(
                        "configuration reload failed, keeping previous: {err}"
                    ));
                }
            },
            Err(err) => {
                log.warn(format!(
                    "configuration reload failed, keeping previous: {err}"
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Backup loop
// ---------------------------------------------------------------------------

async fn run_loop(
    registration: UserRegistration,
    home: PathBuf,
    log: Arc<RollingLog>,
    mut config_rx: watch::Receiver<Arc<BackupConfig>>,
    cancel: CancellationToken,
    state_tx: watch::Sender<WorkerState>,
    intervals: WorkerIntervals,
) {
    let _ = state_tx.send(WorkerState::Running);
    log.info(format!(
        "backup worker started for {}",
        registration.username
    ));

    loop {
        if cancel.is_cancelled() {
            break;
        }
        // Snapshot semantics: the cycle runs one consistent config; reloads
        // take effect on the next iteration, never mid-iteration.
        let config = config_rx.borrow_and_update().clone();

        let mut cycle_failed = false;
        for job in &config.backup.jobs {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(err) = run_job(job, &home, &log, &cancel).await {
                log.error(format!("job '{}' failed: {err}", job.name));
                cycle_failed = true;
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        let pause = if cycle_failed {
            intervals.error_backoff
        } else {
            intervals.cycle
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    let _ = state_tx.send(WorkerState::Stopping);
    log.info(format!(
        "backup worker stopped for {}",
        registration.username
    ));
    let _ = state_tx.send(WorkerState::Stopped);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
