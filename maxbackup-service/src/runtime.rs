//! Service runtime composition: state store + supervisor + IPC server +
//! signal handling, wired together with one cancellation tree.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use maxbackup_core::{IdentityResolver, OsIdentityResolver, Store};

use crate::error::{io_err, ServiceError};
use crate::server;
use crate::supervisor::Supervisor;

/// Run the service until shutdown.
pub async fn run(root: PathBuf, resolver: Arc<dyn IdentityResolver>) -> Result<(), ServiceError> {
    let store = Arc::new(Store::new(&root));
    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::new(store.clone(), resolver.clone(), shutdown.clone());

    supervisor.start_all_from_state().await?;

    let server_handle = {
        let shutdown = shutdown.clone();
        let root = root.clone();
        let store = store.clone();
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let result = server::run(root, store, supervisor, resolver, shutdown.clone()).await;
            shutdown.cancel();
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => tracing::info!("received ctrl-c, shutting down service"),
                        Err(err) => tracing::warn!(error = %err, "ctrl-c handler failed"),
                    }
                    shutdown.cancel();
                }
            }
        })
    };

    let (server_result, signal_result) = tokio::join!(server_handle, signal_handle);
    supervisor.shutdown_workers().await;

    if let Err(err) = signal_result {
        tracing::warn!(error = %err, "signal task join failure");
    }
    match server_result {
        Ok(inner) => inner,
        Err(err) => Err(ServiceError::Protocol(format!(
            "server task join failure: {err}"
        ))),
    }
}

/// Build a multi-threaded runtime and block on [`run`] with the OS identity
/// resolver.
pub fn start_blocking(root: PathBuf) -> Result<(), ServiceError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(root, Arc::new(OsIdentityResolver)))
}
