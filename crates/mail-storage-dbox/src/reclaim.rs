//! Lazy cleanup of temporary files left behind by crashed writers.
//!
//! There is no scheduler. Open and notify paths call
//! [`cleanup_if_exists`], which uses the directory's access and change times
//! to decide whether a sweep is due, so cleanup happens only as often as
//! mailboxes get opened.

use std::fs::{self, File, FileTimes, Metadata};
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

/// Temp files untouched for this long belong to a dead writer.
pub const TMP_DELETE_SECS: u64 = 36 * 60 * 60;
/// Minimum time between two sweeps of the same directory.
pub const TMP_SCAN_SECS: u64 = 8 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimPolicy {
    /// If the directory was accessed this long after its last change,
    /// nothing has happened since the previous sweep. Also the age at
    /// which a temp file is deleted.
    pub quiet_period: Duration,
    /// Sweep once the last access is older than this.
    pub scan_interval: Duration,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(TMP_DELETE_SECS),
            scan_interval: Duration::from_secs(TMP_SCAN_SECS),
        }
    }
}

/// The two timestamps the heuristic looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirTimes {
    pub accessed: SystemTime,
    /// Inode change time where the platform has one, else modification time.
    pub changed: SystemTime,
}

impl DirTimes {
    pub fn of(meta: &Metadata) -> io::Result<Self> {
        Ok(Self {
            accessed: meta.accessed()?,
            changed: changed_time(meta)?,
        })
    }
}

#[cfg(unix)]
fn changed_time(meta: &Metadata) -> io::Result<SystemTime> {
    use std::os::unix::fs::MetadataExt;

    let secs = u64::try_from(meta.ctime()).unwrap_or(0);
    let nanos = u32::try_from(meta.ctime_nsec()).unwrap_or(0);
    Ok(UNIX_EPOCH + Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn changed_time(meta: &Metadata) -> io::Result<SystemTime> {
    meta.modified()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDecision {
    /// No changes since the last sweep.
    Quiet,
    /// Changed, but swept recently enough.
    NotDue,
    Due,
}

pub fn scan_decision(times: DirTimes, now: SystemTime, policy: &ReclaimPolicy) -> ScanDecision {
    let quiet_after = times.changed.checked_add(policy.quiet_period);
    if quiet_after.is_some_and(|t| times.accessed > t) {
        return ScanDecision::Quiet;
    }
    let scan_before = now.checked_sub(policy.scan_interval).unwrap_or(UNIX_EPOCH);
    if times.accessed < scan_before {
        ScanDecision::Due
    } else {
        ScanDecision::NotDue
    }
}

/// Stat `dir` and decide whether to sweep it. A missing or unreadable
/// directory is an error, never "no scan needed".
pub fn should_scan(
    dir: &Path,
    now: SystemTime,
    policy: &ReclaimPolicy,
) -> io::Result<ScanDecision> {
    let meta = fs::metadata(dir)?;
    Ok(scan_decision(DirTimes::of(&meta)?, now, policy))
}

/// Remove files in `dir` named with `prefix` whose access and modification
/// times are both before `cutoff`. Returns how many were removed.
///
/// Best effort: failures are logged and skipped.
pub fn sweep(dir: &Path, prefix: &str, cutoff: SystemTime) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to scan {} for temp files: {}", dir.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(prefix) {
            continue;
        }
        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if !meta.is_file() || !is_older(&meta, cutoff) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed stale temp file {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove stale temp file {}: {}", path.display(), e),
        }
    }

    // Mark the sweep so the next check sees a recent access time.
    let touched = File::open(dir)
        .and_then(|f| f.set_times(FileTimes::new().set_accessed(SystemTime::now())));
    if let Err(e) = touched {
        debug!("Failed to update access time of {}: {}", dir.display(), e);
    }

    if removed > 0 {
        info!("Removed {} stale temp files from {}", removed, dir.display());
    }
    removed
}

fn is_older(meta: &Metadata, cutoff: SystemTime) -> bool {
    let accessed = meta.accessed().map(|t| t < cutoff).unwrap_or(true);
    let modified = meta.modified().map(|t| t < cutoff).unwrap_or(false);
    accessed && modified
}

/// Sweep `dir` if the heuristic says so. Errors only when `dir` can't be
/// stat'ed; the caller classifies that error.
pub fn cleanup_if_exists(
    dir: &Path,
    prefix: &str,
    policy: &ReclaimPolicy,
    now: SystemTime,
) -> io::Result<()> {
    match should_scan(dir, now, policy)? {
        ScanDecision::Due => {
            let cutoff = now.checked_sub(policy.quiet_period).unwrap_or(UNIX_EPOCH);
            sweep(dir, prefix, cutoff);
        }
        decision => debug!("No temp file sweep for {}: {:?}", dir.display(), decision),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    const PREFIX: &str = ".temp.";

    fn setup() -> TempDir {
        TempDir::new().unwrap()
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn set_times(path: &Path, accessed: SystemTime, modified: SystemTime) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_times(FileTimes::new().set_accessed(accessed).set_modified(modified))
            .unwrap();
    }

    #[test]
    fn test_quiet_directory_is_skipped() {
        let policy = ReclaimPolicy {
            quiet_period: Duration::from_secs(60),
            scan_interval: Duration::from_secs(3600),
        };
        let times = DirTimes {
            accessed: at(1_000_100),
            changed: at(1_000_000),
        };
        // even though the last access is ancient relative to `now`
        assert_eq!(scan_decision(times, at(9_000_000), &policy), ScanDecision::Quiet);
    }

    #[test]
    fn test_due_and_not_due() {
        let policy = ReclaimPolicy {
            quiet_period: Duration::from_secs(60),
            scan_interval: Duration::from_secs(3600),
        };
        let times = DirTimes {
            accessed: at(1_000_000),
            changed: at(1_000_000),
        };
        assert_eq!(scan_decision(times, at(1_000_100), &policy), ScanDecision::NotDue);
        assert_eq!(scan_decision(times, at(1_003_601), &policy), ScanDecision::Due);
    }

    #[test]
    fn test_should_scan_missing_dir_is_not_found() {
        let temp = setup();
        let err = should_scan(
            &temp.path().join("gone"),
            SystemTime::now(),
            &ReclaimPolicy::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_should_scan_quiet_on_disk() {
        let temp = setup();
        let dir = temp.path().join("box");
        fs::create_dir(&dir).unwrap();
        // access time 100s past the change time that setting it produces
        let future = SystemTime::now() + Duration::from_secs(100);
        File::open(&dir)
            .unwrap()
            .set_times(FileTimes::new().set_accessed(future))
            .unwrap();

        let policy = ReclaimPolicy {
            quiet_period: Duration::from_secs(60),
            scan_interval: Duration::from_secs(1),
        };
        let decision = should_scan(&dir, SystemTime::now() + Duration::from_secs(7200), &policy)
            .unwrap();
        assert_eq!(decision, ScanDecision::Quiet);
    }

    #[test]
    fn test_sweep_removes_only_old_prefixed_files() {
        let temp = setup();
        let dir = temp.path();
        let two_days_ago = SystemTime::now() - Duration::from_secs(2 * 24 * 3600);

        let old_temp = dir.join(format!("{}1.abc", PREFIX));
        let fresh_temp = dir.join(format!("{}1.def", PREFIX));
        let old_mail = dir.join("u.1");
        for path in [&old_temp, &fresh_temp, &old_mail] {
            fs::write(path, b"x").unwrap();
        }
        set_times(&old_temp, two_days_ago, two_days_ago);
        set_times(&old_mail, two_days_ago, two_days_ago);

        let cutoff = SystemTime::now() - Duration::from_secs(TMP_DELETE_SECS);
        assert_eq!(sweep(dir, PREFIX, cutoff), 1);

        assert!(!old_temp.exists());
        assert!(fresh_temp.exists());
        assert!(old_mail.exists());
    }

    #[test]
    fn test_sweep_missing_dir_is_silent() {
        let temp = setup();
        assert_eq!(sweep(&temp.path().join("gone"), PREFIX, SystemTime::now()), 0);
    }

    #[test]
    fn test_cleanup_when_due() {
        let temp = setup();
        let dir = temp.path().join("box");
        fs::create_dir(&dir).unwrap();
        let stale = dir.join(format!("{}9.zzz", PREFIX));
        fs::write(&stale, b"partial").unwrap();
        let long_ago = SystemTime::now() - Duration::from_secs(3 * 24 * 3600);
        set_times(&stale, long_ago, long_ago);
        File::open(&dir)
            .unwrap()
            .set_times(FileTimes::new().set_accessed(long_ago))
            .unwrap();

        cleanup_if_exists(&dir, PREFIX, &ReclaimPolicy::default(), SystemTime::now()).unwrap();
        assert!(!stale.exists());

        let err = cleanup_if_exists(
            &temp.path().join("gone"),
            PREFIX,
            &ReclaimPolicy::default(),
            SystemTime::now(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
