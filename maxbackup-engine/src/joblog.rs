//! Rolling daily file logs.
//!
//! One file per calendar day named `<prefix>YYYYMMDD.log`; on rollover the
//! directory is pruned to the newest `retain` files. Used for both the
//! per-user worker logs (`backup-*.log`, retain 7) and the service logs
//! (`service-*.log`).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};

use crate::error::{io_err, EngineError};

/// How many daily files to keep.
pub const DEFAULT_RETAIN: usize = 7;

struct ActiveFile {
    date: NaiveDate,
    file: File,
}

/// A rolling daily log sink.
///
/// Write failures never propagate to callers; a sink that cannot write must
/// not take a backup worker down with it.
pub struct RollingLog {
    dir: PathBuf,
    prefix: String,
    retain: usize,
    active: Mutex<ActiveFile>,
}

impl RollingLog {
    /// Open (creating the directory if needed) the sink for today.
    pub fn open(dir: impl Into<PathBuf>, prefix: &str, retain: usize) -> Result<Self, EngineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let today = Utc::now().date_naive();
        let file = open_day_file(&dir, prefix, today)?;
        let log = Self {
            dir,
            prefix: prefix.to_string(),
            retain,
            active: Mutex::new(ActiveFile { date: today, file }),
        };
        log.prune();
        Ok(log)
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.write_line("INF", message.as_ref());
        tracing::debug!(target: "maxbackup::joblog", "{}", message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.write_line("WRN", message.as_ref());
        tracing::debug!(target: "maxbackup::joblog", "{}", message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.write_line("ERR", message.as_ref());
        tracing::debug!(target: "maxbackup::joblog", "{}", message.as_ref());
    }

    /// Append pre-formatted bytes, still honoring daily rollover. Used to
    /// plug the sink into a `tracing` writer.
    pub fn append_raw(&self, bytes: &[u8]) {
        let Ok(mut active) = self.active.lock() else {
            return;
        };
        self.roll_if_needed(&mut active);
        if let Err(err) = active.file.write_all(bytes) {
            tracing::warn!(dir = %self.dir.display(), error = %err, "log write failed");
        }
    }

    /// Path of the file currently being written.
    pub fn current_path(&self) -> PathBuf {
        let date = self
            .active
            .lock()
            .map(|active| active.date)
            .unwrap_or_else(|_| Utc::now().date_naive());
        day_file_path(&self.dir, &self.prefix, date)
    }

    fn write_line(&self, level: &str, message: &str) {
        let Ok(mut active) = self.active.lock() else {
            return;
        };
        self.roll_if_needed(&mut active);
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        if let Err(err) = writeln!(active.file, "{stamp} [{level}] {message}") {
            tracing::warn!(dir = %self.dir.display(), error = %err, "log write failed");
        }
    }

    fn roll_if_needed(&self, active: &mut ActiveFile) {
        let today = Utc::now().date_naive();
        if active.date == today {
            return;
        }
        match open_day_file(&self.dir, &self.prefix, today) {
            Ok(file) => {
                active.date = today;
                active.file = file;
                self.prune();
            }
            Err(err) => {
                tracing::warn!(dir = %self.dir.display(), error = %err, "log rollover failed");
            }
        }
    }

    /// Delete everything but the newest `retain` daily files.
    fn prune(&self) {
        if let Err(err) = prune_daily_files(&self.dir, &self.prefix, self.retain) {
            tracing::warn!(dir = %self.dir.display(), error = %err, "log pruning failed");
        }
    }
}

fn day_file_path(dir: &Path, prefix: &str, date: NaiveDate) -> PathBuf {
    dir.join(format!("{prefix}{}.log", date.format("%Y%m%d")))
}

fn open_day_file(dir: &Path, prefix: &str, date: NaiveDate) -> Result<File, EngineError> {
    let path = day_file_path(dir, prefix, date);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| io_err(&path, e))
}

/// Remove daily files beyond `retain`, oldest first. The `YYYYMMDD` name
/// component sorts lexicographically in date order.
fn prune_daily_files(dir: &Path, prefix: &str, retain: usize) -> std::io::Result<()> {
    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(prefix) && name.ends_with(".log") {
            names.push(name);
        }
    }
    names.sort();
    if names.len() <= retain {
        return Ok(());
    }
    let excess = names.len() - retain;
    for name in names.into_iter().take(excess) {
        fs::remove_file(dir.join(name))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_directory_and_todays_file() {
        let root = TempDir::new().expect("root");
        let dir = root.path().join(".max").join("logs");
        let log = RollingLog::open(&dir, "backup-", DEFAULT_RETAIN).expect("open");

        log.info("first line");
        let contents = fs::read_to_string(log.current_path()).expect("read");
        assert!(contents.contains("[INF] first line"));

        let name = log
            .current_path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(name.starts_with("backup-"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn levels_are_tagged() {
        let root = TempDir::new().expect("root");
        let log = RollingLog::open(root.path(), "backup-", DEFAULT_RETAIN).expect("open");
        log.warn("careful");
        log.error("broken");
        let contents = fs::read_to_string(log.current_path()).expect("read");
        assert!(contents.contains("[WRN] careful"));
        assert!(contents.contains("[ERR] broken"));
    }

    #[test]
    fn prune_keeps_newest_retain_files() {
        let root = TempDir::new().expect("root");
        for day in 1..=10 {
            let name = format!("backup-202601{day:02}.log");
            fs::write(root.path().join(name), "old").expect("write");
        }
        prune_daily_files(root.path(), "backup-", 7).expect("prune");

        let mut remaining: Vec<String> = fs::read_dir(root.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining.len(), 7);
        assert_eq!(remaining[0], "backup-20260104.log", "oldest three removed");
    }

    #[test]
    fn prune_ignores_unrelated_files() {
        let root = TempDir::new().expect("root");
        fs::write(root.path().join("notes.txt"), "keep me").expect("write");
        for day in 1..=9 {
            fs::write(
                root.path().join(format!("backup-202601{day:02}.log")),
                "old",
            )
            .expect("write");
        }
        prune_daily_files(root.path(), "backup-", 7).expect("prune");
        assert!(root.path().join("notes.txt").exists());
    }

    #[test]
    fn append_raw_writes_bytes() {
        let root = TempDir::new().expect("root");
        let log = RollingLog::open(root.path(), "service-", DEFAULT_RETAIN).expect("open");
        log.append_raw(b"raw tracing line\n");
        let contents = fs::read_to_string(log.current_path()).expect("read");
        assert!(contents.contains("raw tracing line"));
    }
}
