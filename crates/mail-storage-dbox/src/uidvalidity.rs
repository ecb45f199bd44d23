//! UID validity allocation.
//!
//! A counter file in the control root hands out validity values that are
//! unique for the whole storage: a recreated mailbox never gets the value a
//! client may still have cached for its predecessor.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use tracing::debug;

pub const UIDVALIDITY_FILE_NAME: &str = "dbox-uidvalidity";

/// Allocate the next validity value from the counter at `path`.
///
/// The value is `max(previous + 1, now)` in Unix seconds, so it stays
/// monotonic even when the counter file is lost. Concurrent allocators
/// serialize on an exclusive lock of the counter file. With `fsync` unset
/// the new value isn't forced to disk.
pub fn next_uid_validity(path: &Path, fsync: bool) -> io::Result<u32> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.lock_exclusive()?;

    let mut content = String::new();
    file.read_to_string(&mut content)?;
    let previous: u32 = content.trim().parse().unwrap_or(0);

    let now = u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX);
    let next = previous.checked_add(1).unwrap_or(1).max(now);

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", next)?;
    if fsync {
        file.sync_data()?;
    }
    let _ = FileExt::unlock(&file);

    debug!("Allocated uid validity {} from {}", next, path.display());
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn setup() -> (std::path::PathBuf, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("control").join(UIDVALIDITY_FILE_NAME);
        (path, temp_dir)
    }

    #[test]
    fn test_strictly_increasing() {
        let (path, _temp) = setup();
        let first = next_uid_validity(&path, true).unwrap();
        let second = next_uid_validity(&path, false).unwrap();
        let third = next_uid_validity(&path, false).unwrap();
        assert!(first > 0);
        assert!(second > first);
        assert!(third > second);
    }

    #[test]
    fn test_counter_ahead_of_clock() {
        let (path, _temp) = setup();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("{}\n", u32::MAX - 10)).unwrap();
        assert_eq!(next_uid_validity(&path, false).unwrap(), u32::MAX - 9);
    }

    #[test]
    fn test_garbage_counter_restarts_from_clock() {
        let (path, _temp) = setup();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not a number").unwrap();
        let value = next_uid_validity(&path, false).unwrap();
        let now = chrono::Utc::now().timestamp() as u32;
        assert!(value <= now && value + 5 >= now);
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let (path, _temp) = setup();
        const THREADS: usize = 8;
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let path = path.clone();
                thread::spawn(move || {
                    barrier.wait();
                    next_uid_validity(&path, false).unwrap()
                })
            })
            .collect();

        let values: HashSet<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(values.len(), THREADS);
    }
}
