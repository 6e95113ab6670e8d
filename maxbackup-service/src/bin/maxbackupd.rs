//! MaxBackup service daemon.
//!
//! Runs in the foreground; the process supervisor (systemd or equivalent)
//! owns daemonization. Logs go to rolling daily files under the service
//! data directory, filtered by `RUST_LOG`.

use std::io::Write;
use std::sync::Arc;

use maxbackup_engine::RollingLog;
use maxbackup_service::{paths, runtime};

fn main() {
    let root = paths::service_root();

    let service_log = match RollingLog::open(paths::logs_dir_at(&root), "service-", 7) {
        Ok(log) => Arc::new(log),
        Err(err) => {
            eprintln!("maxbackupd: cannot open service log: {err}");
            std::process::exit(1);
        }
    };
    init_tracing(service_log);

    tracing::info!(root = %root.display(), "maxbackupd starting");
    if let Err(err) = runtime::start_blocking(root) {
        tracing::error!(error = %err, "service terminated with error");
        std::process::exit(1);
    }
}

fn init_tracing(log: Arc<RollingLog>) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(move || ServiceLogWriter(log.clone()))
        .try_init();
}

/// Bridges `tracing` output into the rolling service log.
struct ServiceLogWriter(Arc<RollingLog>);

impl Write for ServiceLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.append_raw(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
