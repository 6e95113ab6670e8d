//! IPC endpoint: a named local socket accepting one request per connection.
//!
//! Each accepted connection is served by its own task, so a slow client
//! never blocks others. A conversation is one request in, a stream of
//! non-final progress responses out, then exactly one final response.

use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use maxbackup_core::{IdentityResolver, ServiceConfig, Sid, Store};

use crate::codec::{read_message, write_message};
use crate::error::{io_err, ServiceError};
use crate::paths;
use crate::protocol::{PipeRequest, PipeResponse, RequestAction};
use crate::supervisor::Supervisor;

/// Run the accept loop until shutdown. The socket file is removed on exit.
pub async fn run(
    root: PathBuf,
    store: Arc<Store>,
    supervisor: Arc<Supervisor>,
    resolver: Arc<dyn IdentityResolver>,
    shutdown: CancellationToken,
) -> Result<(), ServiceError> {
    let run_dir = paths::run_dir_at(&root);
    if !run_dir.exists() {
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| io_err(&run_dir, e))?;
    }

    let socket = paths::socket_path_at(&root);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "IPC endpoint ready");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let store = store.clone();
                let supervisor = supervisor.clone();
                let resolver = resolver.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, store, supervisor, resolver).await {
                        tracing::warn!(error = %err, "pipe client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = std::fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    store: Arc<Store>,
    supervisor: Arc<Supervisor>,
    resolver: Arc<dyn IdentityResolver>,
) -> Result<(), ServiceError> {
    let timeout = match store.load().await {
        Ok(state) => state.pipe_timeout(),
        Err(_) => ServiceConfig::default().pipe_timeout(),
    };
    let (mut reader, mut writer) = stream.into_split();

    let request: PipeRequest = match read_message(&mut reader, timeout).await {
        Ok(request) => request,
        Err(ServiceError::EndOfStream) => return Ok(()),
        Err(err) => {
            let response = PipeResponse::error(format!("invalid request: {err}"));
            write_message(&mut writer, &response, timeout).await?;
            return Ok(());
        }
    };

    if request.sid.is_empty() {
        let response = PipeResponse::error("sid must not be empty");
        return write_message(&mut writer, &response, timeout).await;
    }

    let sid = Sid::from(request.sid.clone());
    // Display-name translation is for logging only; a miss is non-fatal.
    let username = resolver
        .resolve(&sid)
        .map(|identity| identity.display_name)
        .unwrap_or_else(|| sid.to_string());
    tracing::info!(action = %request.action, user = %username, "pipe request");

    if let Err(err) = dispatch(&request, sid, username, &supervisor, &mut writer, timeout).await {
        tracing::warn!(error = %err, "request handling failed");
        let response = PipeResponse::error(format!("internal error: {err}"));
        let _ = write_message(&mut writer, &response, timeout).await;
    }
    Ok(())
}

async fn dispatch(
    request: &PipeRequest,
    sid: Sid,
    username: String,
    supervisor: &Arc<Supervisor>,
    writer: &mut OwnedWriteHalf,
    timeout: Duration,
) -> Result<(), ServiceError> {
    let final_response = match RequestAction::parse(&request.action) {
        Some(RequestAction::Register) => {
            write_message(writer, &PipeResponse::info("Validating configuration..."), timeout)
                .await?;
            let Some(config_path) = request.config_path.clone() else {
                return write_message(
                    writer,
                    &PipeResponse::error("configPath is required for REGISTER"),
                    timeout,
                )
                .await;
            };
            write_message(
                writer,
                &PipeResponse::info(format!("Config path: {config_path}")),
                timeout,
            )
            .await?;
            supervisor
                .register(sid, username, PathBuf::from(config_path))
                .await
        }
        Some(RequestAction::Unregister) => {
            write_message(writer, &PipeResponse::info("Stopping worker..."), timeout).await?;
            supervisor.unregister(&sid).await
        }
        Some(RequestAction::Status) => supervisor.status(&sid).await,
        None => PipeResponse::error(format!("Unknown action: {}", request.action)),
    };
    write_message(writer, &final_response, timeout).await
}

/// Remove a stale socket file left behind by a dead service; refuse to bind
/// over a live one.
fn prepare_socket_for_bind(socket: &Path) -> Result<(), ServiceError> {
    if !socket.exists() {
        return Ok(());
    }
    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(ServiceError::Protocol(format!(
                "IPC endpoint already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale socket before bind",
            );
        }
    }
    match std::fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

/// Any authenticated local user may connect; the owning service principal
/// retains full control of the file itself.
#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), ServiceError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), ServiceError> {
    Ok(())
}
