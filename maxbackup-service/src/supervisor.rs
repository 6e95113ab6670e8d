//! Worker supervision.
//!
//! The supervisor exclusively owns the mapping `sid → UserWorker`. One
//! non-reentrant lock serializes every public operation and every mutation
//! of that map; internal `_locked` helpers assume the lock is held and never
//! call the public locking variants.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use maxbackup_core::{
    BackupConfig, IdentityResolver, ServiceConfig, Sid, Store, UserRegistration, ValidationError,
};

use crate::error::ServiceError;
use crate::protocol::PipeResponse;
use crate::worker::{UserWorker, WorkerIntervals};

/// How long to wait between attempts to start a worker whose identity could
/// not be resolved yet.
const START_RETRY_INTERVAL: Duration = Duration::from_secs(60);

enum StartFailure {
    /// The identity resolver returned nothing; worth retrying later.
    IdentityUnresolved,
    Service(ServiceError),
}

enum RetryOutcome {
    Done,
    TryAgain,
}

/// Owns all running workers and the registration workflow.
pub struct Supervisor {
    store: Arc<Store>,
    resolver: Arc<dyn IdentityResolver>,
    shutdown: CancellationToken,
    intervals: WorkerIntervals,
    workers: Mutex<HashMap<Sid, UserWorker>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<Store>,
        resolver: Arc<dyn IdentityResolver>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Self::with_intervals(store, resolver, shutdown, WorkerIntervals::default())
    }

    pub fn with_intervals(
        store: Arc<Store>,
        resolver: Arc<dyn IdentityResolver>,
        shutdown: CancellationToken,
        intervals: WorkerIntervals,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            resolver,
            shutdown,
            intervals,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// On service start: try to start a worker for every persisted
    /// registration, continuing past individual failures.
    pub async fn start_all_from_state(self: &Arc<Self>) -> Result<(), ServiceError> {
        let state = self.store.load().await?;
        let mut workers = self.workers.lock().await;
        for registration in state.registered_users {
            if self.shutdown.is_cancelled() {
                break;
            }
            let sid = registration.sid.clone();
            match self.start_worker_locked(&mut workers, registration) {
                Ok(()) => tracing::info!(sid = %sid, "backup worker started"),
                Err(StartFailure::IdentityUnresolved) => {
                    tracing::warn!(sid = %sid, "cannot resolve user profile yet, will retry");
                    self.schedule_start_retry(sid);
                }
                Err(StartFailure::Service(err)) => {
                    tracing::warn!(sid = %sid, error = %err, "backup worker failed to start");
                }
            }
        }
        Ok(())
    }

    /// Register a user: validate, persist, start the worker.
    pub async fn register(
        self: &Arc<Self>,
        sid: Sid,
        username: String,
        config_path: PathBuf,
    ) -> PipeResponse {
        let mut workers = self.workers.lock().await;
        let mut state = match self.store.load().await {
            Ok(state) => state,
            Err(err) => return PipeResponse::error(format!("cannot load service state: {err}")),
        };
        if state.find_user(&sid).is_some() {
            return PipeResponse::error(format!("User {sid} is already registered"));
        }
        let Some(identity) = self.resolver.resolve(&sid) else {
            return PipeResponse::error(format!("cannot resolve user profile for {sid}"));
        };

        let text = match tokio::fs::read_to_string(&config_path).await {
            Ok(text) => text,
            Err(err) => {
                return PipeResponse::error_with_validation(
                    "configuration validation failed",
                    vec![ValidationError {
                        job: None,
                        field: "ConfigPath".to_string(),
                        error: format!("cannot read {}: {err}", config_path.display()),
                    }],
                )
            }
        };
        if let Err(errors) = BackupConfig::parse_and_validate(&text, &identity.home_directory) {
            return PipeResponse::error_with_validation("configuration validation failed", errors);
        }

        let registration = UserRegistration {
            sid: sid.clone(),
            username: username.clone(),
            config_path,
            registered_at: Utc::now(),
        };
        state.registered_users.push(registration.clone());
        if let Err(err) = self.store.save(&state).await {
            return PipeResponse::error(format!("cannot persist service state: {err}"));
        }

        match self.start_worker_locked(&mut workers, registration) {
            Ok(()) => {}
            Err(StartFailure::IdentityUnresolved) => {
                // Registered durably, but the profile vanished since the
                // resolve above; the retry loop will pick it up.
                tracing::warn!(sid = %sid, "worker start deferred: identity unresolved");
                self.schedule_start_retry(sid.clone());
            }
            Err(StartFailure::Service(err)) => {
                tracing::warn!(sid = %sid, error = %err, "worker start failed");
            }
        }
        PipeResponse::success(format!("User {username} registered"))
    }

    /// Unregister a user: stop the worker within the configured deadline,
    /// then drop the registration from the persisted state.
    pub async fn unregister(&self, sid: &Sid) -> PipeResponse {
        let mut workers = self.workers.lock().await;
        let mut state = match self.store.load().await {
            Ok(state) => state,
            Err(err) => return PipeResponse::error(format!("cannot load service state: {err}")),
        };
        if state.find_user(sid).is_none() {
            return PipeResponse::error(format!("User {sid} is not registered"));
        }
        if let Some(worker) = workers.remove(sid) {
            worker.stop(state.worker_shutdown_timeout()).await;
        }
        state.registered_users.retain(|r| &r.sid != sid);
        if let Err(err) = self.store.save(&state).await {
            return PipeResponse::error(format!("cannot persist service state: {err}"));
        }
        PipeResponse::success(format!("User {sid} unregistered"))
    }

    /// Report registration and worker state for one user.
    pub async fn status(&self, sid: &Sid) -> PipeResponse {
        let workers = self.workers.lock().await;
        let state = match self.store.load().await {
            Ok(state) => state,
            Err(err) => return PipeResponse::error(format!("cannot load service state: {err}")),
        };
        let Some(registration) = state.find_user(sid) else {
            return PipeResponse::info_final(format!("Not registered: {sid}"));
        };
        let running = workers.get(sid).map(UserWorker::is_running).unwrap_or(false);
        PipeResponse::success(format!(
            "Registered: Yes\nConfig: {}\nWorker: {}\nRegistered At: {}",
            registration.config_path.display(),
            if running { "Running" } else { "Stopped" },
            registration.registered_at.to_rfc3339(),
        ))
    }

    /// Stop every worker in parallel, each with the configured grace period.
    pub async fn shutdown_workers(&self) {
        let timeout = match self.store.load().await {
            Ok(state) => state.worker_shutdown_timeout(),
            Err(_) => ServiceConfig::default().worker_shutdown_timeout(),
        };
        let mut workers = self.workers.lock().await;
        let stops: Vec<_> = workers
            .drain()
            .map(|(_, worker)| tokio::spawn(worker.stop(timeout)))
            .collect();
        drop(workers);
        for stop in stops {
            let _ = stop.await;
        }
    }

    /// Whether a worker currently exists (running or not) for `sid`.
    pub async fn has_worker(&self, sid: &Sid) -> bool {
        self.workers.lock().await.contains_key(sid)
    }

    /// Start a worker and insert it into the map. Caller holds the worker
    /// lock.
    fn start_worker_locked(
        &self,
        workers: &mut HashMap<Sid, UserWorker>,
        registration: UserRegistration,
    ) -> Result<(), StartFailure> {
        let identity = self
            .resolver
            .resolve(&registration.sid)
            .ok_or(StartFailure::IdentityUnresolved)?;
        let worker = UserWorker::spawn_with(
            registration.clone(),
            identity.home_directory,
            self.shutdown.child_token(),
            self.intervals,
        )
        .map_err(StartFailure::Service)?;
        workers.insert(registration.sid, worker);
        Ok(())
    }

    /// Retry a deferred worker start every 60 s until it succeeds, the
    /// registration disappears, or the service stops. Each attempt re-enters
    /// through the public locking path.
    fn schedule_start_retry(self: &Arc<Self>, sid: Sid) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(START_RETRY_INTERVAL) => {}
                }
                match supervisor.try_start(&sid).await {
                    RetryOutcome::Done => break,
                    RetryOutcome::TryAgain => {}
                }
            }
        });
    }

    async fn try_start(&self, sid: &Sid) -> RetryOutcome {
        let mut workers = self.workers.lock().await;
        let state = match self.store.load().await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(sid = %sid, error = %err, "state load failed during start retry");
                return RetryOutcome::TryAgain;
            }
        };
        let Some(registration) = state.find_user(sid).cloned() else {
            // Unregistered in the meantime; nothing left to start.
            return RetryOutcome::Done;
        };
        if workers.contains_key(sid) {
            return RetryOutcome::Done;
        }
        match self.start_worker_locked(&mut workers, registration) {
            Ok(()) => {
                tracing::info!(sid = %sid, "backup worker started after retry");
                RetryOutcome::Done
            }
            Err(StartFailure::IdentityUnresolved) => RetryOutcome::TryAgain,
            Err(StartFailure::Service(err)) => {
                tracing::warn!(sid = %sid, error = %err, "worker start failed during retry");
                RetryOutcome::TryAgain
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
