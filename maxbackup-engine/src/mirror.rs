//! The mirror loop: enumerate, compare, copy.
//!
//! `run_job` never fails on a single file. Every per-file outcome lands in
//! one of four counters (`backup`, `up_to_date`, `error`, `missing`); only a
//! job whose glob patterns cannot be compiled errors out, which the caller
//! treats as a cycle failure.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use filetime::FileTime;
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use maxbackup_core::{is_sharing_violation, BackupJob};

use crate::error::EngineError;
use crate::joblog::RollingLog;

/// After this much wall-clock work, yield briefly so the worker does not
/// saturate I/O.
const THROTTLE_WINDOW: Duration = Duration::from_millis(500);
const THROTTLE_PAUSE: Duration = Duration::from_millis(10);
/// How often to log progress for long-running jobs.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Patterns excluded implicitly when a job's source is a volume root.
const VOLUME_ROOT_EXCLUDES: &[&str] = &[
    "$RECYCLE.BIN/**",
    "System Volume Information/**",
    "*~",
];

/// Outcome accounting for one `run_job` invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub backup_count: u64,
    pub up_to_date_count: u64,
    pub error_count: u64,
    pub missing_count: u64,
    pub backup_byte_count: u64,
    /// How many files survived enumeration and filtering.
    pub enumerated: u64,
    /// Whether the run was cut short by cancellation.
    pub cancelled: bool,
}

impl JobSummary {
    /// Files that reached the copy loop and were classified.
    pub fn processed(&self) -> u64 {
        self.backup_count + self.up_to_date_count + self.error_count + self.missing_count
    }
}

/// Mirror one job's matching files from its source tree into its destination.
///
/// Cancellation is honored between files and inside sleeps; a cancelled run
/// returns normally with `cancelled` set. A missing source directory is a
/// warning, not an error.
pub async fn run_job(
    job: &BackupJob,
    home: &Path,
    log: &RollingLog,
    cancel: &CancellationToken,
) -> Result<JobSummary, EngineError> {
    let mut summary = JobSummary::default();
    let source = job.expanded_source(home);
    let destination = job.expanded_destination(home);

    if !source.is_dir() {
        log.warn(format!(
            "job '{}': source directory {} does not exist, skipping",
            job.name,
            source.display()
        ));
        return Ok(summary);
    }
    if !destination.exists() {
        if let Err(err) = tokio::fs::create_dir_all(&destination).await {
            log.error(format!(
                "job '{}': cannot create destination {}: {err}",
                job.name,
                destination.display()
            ));
            return Ok(summary);
        }
    }

    let matcher = JobMatcher::build(job, &source)?;

    let files = {
        let source = source.clone();
        let matcher = matcher.clone();
        let cancel = cancel.clone();
        match tokio::task::spawn_blocking(move || enumerate_files(&source, &matcher, &cancel)).await
        {
            Ok(files) => files,
            Err(err) => {
                log.error(format!("job '{}': enumeration failed: {err}", job.name));
                return Ok(summary);
            }
        }
    };
    if cancel.is_cancelled() {
        summary.cancelled = true;
        return Ok(summary);
    }

    summary.enumerated = files.len() as u64;
    let total = files.len();
    log.info(format!("job '{}': {total} files to consider", job.name));

    let mut throttle_started = Instant::now();
    let mut last_report = Instant::now();
    for (index, file) in files.iter().enumerate() {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }
        copy_file(file, &source, &destination, log, &mut summary).await;

        if throttle_started.elapsed() >= THROTTLE_WINDOW {
            tokio::select! {
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(THROTTLE_PAUSE) => {}
            }
            throttle_started = Instant::now();
        }
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            let percent = ((index + 1) * 100) / total.max(1);
            log.info(format!(
                "job '{}': {percent}% ({} of {total} files)",
                job.name,
                index + 1
            ));
            last_report = Instant::now();
        }
    }

    log_summary(job, &summary, log);
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Matching and enumeration
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct JobMatcher {
    include: GlobSet,
    exclude: GlobSet,
}

impl JobMatcher {
    fn build(job: &BackupJob, source: &Path) -> Result<Self, EngineError> {
        let mut include = GlobSetBuilder::new();
        for pattern in &job.include {
            include.add(Glob::new(pattern)?);
        }
        let mut exclude = GlobSetBuilder::new();
        for pattern in &job.exclude {
            exclude.add(Glob::new(pattern)?);
        }
        if is_volume_root(source) {
            for pattern in VOLUME_ROOT_EXCLUDES {
                exclude.add(Glob::new(pattern)?);
            }
        }
        Ok(Self {
            include: include.build()?,
            exclude: exclude.build()?,
        })
    }

    /// Match against the path relative to the job's source root.
    fn matches(&self, relative: &Path) -> bool {
        self.include.is_match(relative) && !self.exclude.is_match(relative)
    }
}

fn is_volume_root(path: &Path) -> bool {
    path.parent().is_none()
}

fn enumerate_files(source: &Path, matcher: &JobMatcher, cancel: &CancellationToken) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(source) {
        if cancel.is_cancelled() {
            break;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(error = %err, "walk error during enumeration");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        if !matcher.matches(relative) {
            continue;
        }
        if is_skipped_placeholder(entry.path()) {
            continue;
        }
        files.push(entry.path().to_path_buf());
    }
    files
}

/// Cloud-provider placeholder files look like `.{hex-or-dash}` of length 33
/// or 37. They are skipped only when the OS marks them with the "system"
/// attribute; where that attribute does not exist the file is kept.
fn is_skipped_placeholder(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.len() != 33 && name.len() != 37 {
        return false;
    }
    if !placeholder_pattern().is_match(name) {
        return false;
    }
    matches!(has_system_attribute(path), Some(true))
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\.[0-9A-Fa-f-]{32,36}$").expect("placeholder pattern"))
}

#[cfg(windows)]
fn has_system_attribute(path: &Path) -> Option<bool> {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_SYSTEM: u32 = 0x4;
    std::fs::metadata(path)
        .ok()
        .map(|meta| meta.file_attributes() & FILE_ATTRIBUTE_SYSTEM != 0)
}

#[cfg(not(windows))]
fn has_system_attribute(_path: &Path) -> Option<bool> {
    None
}

// ---------------------------------------------------------------------------
// Per-file copy
// ---------------------------------------------------------------------------

async fn copy_file(
    source_file: &Path,
    source_root: &Path,
    destination_root: &Path,
    log: &RollingLog,
    summary: &mut JobSummary,
) {
    let relative = match source_file.strip_prefix(source_root) {
        Ok(relative) => relative,
        Err(_) => {
            summary.error_count += 1;
            return;
        }
    };
    let destination = destination_root.join(relative);

    if let Some(parent) = destination.parent() {
        if !parent.exists() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                log.error(format!(
                    "cannot create directory {}: {err}",
                    parent.display()
                ));
                summary.error_count += 1;
                return;
            }
        }
    }

    if let Ok(dest_meta) = tokio::fs::metadata(&destination).await {
        clear_restrictive_permissions(&destination, &dest_meta).await;
        if let Ok(src_meta) = tokio::fs::metadata(source_file).await {
            let src_mtime = FileTime::from_last_modification_time(&src_meta);
            let dest_mtime = FileTime::from_last_modification_time(&dest_meta);
            if src_mtime == dest_mtime {
                summary.up_to_date_count += 1;
                return;
            }
        }
    }

    match tokio::fs::copy(source_file, &destination).await {
        Ok(bytes) => {
            summary.backup_count += 1;
            summary.backup_byte_count += bytes;
            propagate_timestamps(source_file, &destination, log).await;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            // Source disappeared between enumeration and copy.
            summary.missing_count += 1;
        }
        Err(err)
            if is_sharing_violation(&err) || err.kind() == io::ErrorKind::PermissionDenied =>
        {
            log.warn(format!("cannot copy {}: {err}", source_file.display()));
            summary.error_count += 1;
        }
        Err(err) => {
            log.error(format!(
                "failed to copy {}: {err}",
                source_file.display()
            ));
            summary.error_count += 1;
        }
    }
}

/// Make an existing destination file overwritable again.
async fn clear_restrictive_permissions(path: &Path, meta: &std::fs::Metadata) {
    let mut permissions = meta.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = permissions.mode();
        if mode & 0o200 != 0 {
            return;
        }
        permissions.set_mode(mode | 0o200);
    }
    #[cfg(not(unix))]
    {
        if !permissions.readonly() {
            return;
        }
        permissions.set_readonly(false);
    }
    if let Err(err) = tokio::fs::set_permissions(path, permissions).await {
        tracing::debug!(path = %path.display(), error = %err, "could not clear read-only bit");
    }
}

/// Best-effort timestamp propagation after a successful copy. Failures are
/// logged, never counted.
async fn propagate_timestamps(source: &Path, destination: &Path, log: &RollingLog) {
    let meta = match tokio::fs::metadata(source).await {
        Ok(meta) => meta,
        Err(err) => {
            log.warn(format!(
                "could not read timestamps of {}: {err}",
                source.display()
            ));
            return;
        }
    };
    let atime = FileTime::from_last_access_time(&meta);
    let mtime = FileTime::from_last_modification_time(&meta);
    let target = destination.to_path_buf();
    let result =
        tokio::task::spawn_blocking(move || filetime::set_file_times(&target, atime, mtime)).await;
    if let Ok(Err(err)) = result {
        log.warn(format!(
            "could not propagate timestamps to {}: {err}",
            destination.display()
        ));
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

fn log_summary(job: &BackupJob, summary: &JobSummary, log: &RollingLog) {
    if summary.cancelled {
        log.info(format!(
            "job '{}': cancelled after {} of {} files",
            job.name,
            summary.processed(),
            summary.enumerated
        ));
    } else if summary.backup_count == 0
        && summary.error_count == 0
        && summary.missing_count == 0
    {
        log.info(format!(
            "job '{}': all {} files up to date",
            job.name, summary.up_to_date_count
        ));
    } else {
        log.info(format!(
            "job '{}': backed up {} files ({}), {} already up to date",
            job.name,
            summary.backup_count,
            format_bytes(summary.backup_byte_count),
            summary.up_to_date_count
        ));
    }
    if summary.error_count > 0 {
        log.warn(format!(
            "job '{}': {} files could not be copied",
            job.name, summary.error_count
        ));
    }
    if summary.missing_count > 0 {
        log.warn(format!(
            "job '{}': {} files disappeared during the run",
            job.name, summary.missing_count
        ));
    }
}

/// Human-readable byte size for summary lines.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_patterns(include: &[&str], exclude: &[&str]) -> BackupJob {
        BackupJob {
            name: "test".to_string(),
            source: "/src".to_string(),
            destination: "/dst".to_string(),
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn matcher_applies_include_then_exclude() {
        let job = job_with_patterns(&["**/*.txt"], &["secret/**"]);
        let matcher = JobMatcher::build(&job, Path::new("/data/docs")).expect("build");
        assert!(matcher.matches(Path::new("a.txt")));
        assert!(matcher.matches(Path::new("sub/b.txt")));
        assert!(!matcher.matches(Path::new("secret/c.txt")));
        assert!(!matcher.matches(Path::new("image.png")));
    }

    #[test]
    fn matcher_rejects_invalid_pattern() {
        let job = job_with_patterns(&["[broken"], &[]);
        assert!(matches!(
            JobMatcher::build(&job, Path::new("/data")),
            Err(EngineError::Glob(_))
        ));
    }

    #[test]
    fn volume_root_gets_implicit_excludes() {
        let job = job_with_patterns(&["**/*"], &[]);
        let matcher = JobMatcher::build(&job, Path::new("/")).expect("build");
        assert!(!matcher.matches(Path::new("$RECYCLE.BIN/S-1-5/file")));
        assert!(!matcher.matches(Path::new("System Volume Information/x")));
        assert!(!matcher.matches(Path::new("notes.txt~")));
        assert!(matcher.matches(Path::new("home/alice/notes.txt")));
    }

    #[test]
    fn non_root_source_has_no_implicit_excludes() {
        let job = job_with_patterns(&["**/*"], &[]);
        let matcher = JobMatcher::build(&job, Path::new("/data")).expect("build");
        assert!(matcher.matches(Path::new("notes.txt~")));
    }

    #[test]
    fn placeholder_pattern_matches_expected_shapes() {
        // 32 hex chars after the dot: total length 33.
        let hex32 = format!(".{}", "a1b2c3d4".repeat(4));
        assert_eq!(hex32.len(), 33);
        assert!(placeholder_pattern().is_match(&hex32));

        // Guid-with-dashes shape: total length 37.
        let guid = ".123e4567-e89b-12d3-a456-426614174000";
        assert_eq!(guid.len(), 37);
        assert!(placeholder_pattern().is_match(guid));

        assert!(!placeholder_pattern().is_match("regular.txt"));
        assert!(!placeholder_pattern().is_match(".short"));
    }

    #[test]
    fn placeholders_are_kept_where_system_attribute_is_unavailable() {
        #[cfg(not(windows))]
        {
            let name = format!(".{}", "a1b2c3d4".repeat(4));
            assert!(!is_skipped_placeholder(Path::new(&name)));
        }
    }

    #[test]
    fn format_bytes_scales_units() {
        assert_eq!(format_bytes(0), "0 bytes");
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
