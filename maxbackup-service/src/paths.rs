use std::path::{Path, PathBuf};

pub const SERVICE_DIR: &str = "MaxBackup";
pub const PIPE_NAME: &str = "MaxBackupPipe";

/// The shared-program-data root owned by the service.
#[cfg(windows)]
pub fn service_root() -> PathBuf {
    let data = std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string());
    PathBuf::from(data).join(SERVICE_DIR)
}

/// The shared-program-data root owned by the service.
#[cfg(not(windows))]
pub fn service_root() -> PathBuf {
    PathBuf::from("/var/lib").join(SERVICE_DIR)
}

pub fn run_dir_at(root: &Path) -> PathBuf {
    root.join("run")
}

pub fn socket_path_at(root: &Path) -> PathBuf {
    run_dir_at(root).join(PIPE_NAME)
}

pub fn logs_dir_at(root: &Path) -> PathBuf {
    root.join("logs")
}
