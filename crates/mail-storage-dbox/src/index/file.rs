use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use fs2::FileExt;
use mail_storage_core::{
    IndexChange, IndexError, IndexSync, IndexSyncFlags, IndexTransaction, IndexView, MailIndex,
    SyncBegin,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

pub const INDEX_FILE_NAME: &str = "mailbox.index";
pub const LOG_FILE_NAME: &str = "mailbox.index.log";

/// On-disk form of `mailbox.index`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    /// Length of the log already folded into `view`.
    log_offset: u64,
    #[serde(flatten)]
    view: IndexView,
}

/// File-backed index engine.
///
/// `mailbox.index` holds a snapshot of the view; `mailbox.index.log` holds
/// one JSON line per committed change set. A commit appends to the log first
/// and then atomically replaces the snapshot, so a crash in between leaves a
/// log tail that the next reader replays.
///
/// The log doubles as the lock: a sync scope holds an exclusive lock on it
/// from `sync_begin` until commit or rollback, across threads and processes.
#[derive(Debug)]
pub struct FileIndex {
    index_path: PathBuf,
    log_path: PathBuf,
    fsync: bool,
    last_error: Mutex<Option<String>>,
}

impl FileIndex {
    /// Open the index in `dir`, creating the directory if needed. The files
    /// themselves appear on first commit.
    pub fn open(dir: impl AsRef<Path>, fsync_disable: bool) -> Result<Self, IndexError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            IndexError::Io(format!("Failed to create index dir {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            index_path: dir.join(INDEX_FILE_NAME),
            log_path: dir.join(LOG_FILE_NAME),
            fsync: !fsync_disable,
            last_error: Mutex::new(None),
        })
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Whether anything was ever committed.
    pub fn exists(&self) -> bool {
        self.index_path.exists()
    }

    fn record<T>(&self, result: Result<T, IndexError>) -> Result<T, IndexError> {
        if let Err(e) = &result {
            *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
        }
        result
    }

    fn read_snapshot(&self) -> Result<IndexFile, IndexError> {
        match fs::read(&self.index_path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                IndexError::Corrupted(format!("{}: {}", self.index_path.display(), e))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(IndexFile::default()),
            Err(e) => Err(IndexError::Io(format!(
                "Failed to read {}: {}",
                self.index_path.display(),
                e
            ))),
        }
    }

    /// Snapshot plus whatever complete log lines follow its offset. Returns
    /// the view, the log length covered by it, and whether any lines were
    /// replayed.
    fn load(&self, log: &mut File) -> Result<(IndexView, u64, bool), IndexError> {
        let IndexFile {
            log_offset,
            mut view,
        } = self.read_snapshot()?;

        let log_len = log
            .metadata()
            .map_err(|e| {
                IndexError::Io(format!("fstat({}) failed: {}", self.log_path.display(), e))
            })?
            .len();
        if log_len < log_offset {
            return Err(IndexError::Corrupted(format!(
                "{} is shorter ({}) than the index expects ({})",
                self.log_path.display(),
                log_len,
                log_offset
            )));
        }
        if log_len == log_offset {
            return Ok((view, log_offset, false));
        }

        let mut tail = Vec::new();
        log.seek(SeekFrom::Start(log_offset))
            .and_then(|_| log.read_to_end(&mut tail))
            .map_err(|e| {
                IndexError::Io(format!("Failed to read {}: {}", self.log_path.display(), e))
            })?;

        let mut covered = log_offset;
        let mut replayed = false;
        for line in tail.split_inclusive(|b| *b == b'\n') {
            // a line without its newline is a write still in progress, or a
            // crashed one
            if line.last() != Some(&b'\n') {
                break;
            }
            let changes: Vec<IndexChange> = serde_json::from_slice(line).map_err(|e| {
                IndexError::Corrupted(format!("{}: {}", self.log_path.display(), e))
            })?;
            for change in &changes {
                view.apply(change);
            }
            covered += line.len() as u64;
            replayed = true;
        }
        Ok((view, covered, replayed))
    }

    fn open_log(&self) -> Result<File, IndexError> {
        OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.log_path)
            .map_err(|e| IndexError::Io(format!("open({}) failed: {}", self.log_path.display(), e)))
    }

    fn write_snapshot(&self, snapshot: &IndexFile) -> Result<(), IndexError> {
        let json = serde_json::to_vec(snapshot)
            .map_err(|e| IndexError::Serialization(format!("Failed to serialize index: {}", e)))?;

        // Write atomically via temp file
        let temp_path = self.index_path.with_extension("index.tmp");
        let write = || -> io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&json)?;
            if self.fsync {
                file.sync_data()?;
            }
            fs::rename(&temp_path, &self.index_path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            IndexError::Io(format!("Failed to write {}: {}", self.index_path.display(), e))
        })
    }

    fn begin(&self, flags: IndexSyncFlags) -> Result<SyncBegin<'_>, IndexError> {
        let mut log = self.open_log()?;
        log.lock_exclusive().map_err(|e| {
            IndexError::Io(format!("flock({}) failed: {}", self.log_path.display(), e))
        })?;

        let (view, log_len, replayed) = self.load(&mut log)?;
        // drop a torn trailing write so the next append starts clean
        let full_len = log
            .metadata()
            .map(|m| m.len())
            .map_err(|e| {
                IndexError::Io(format!("fstat({}) failed: {}", self.log_path.display(), e))
            })?;
        if full_len > log_len {
            warn!("Truncating torn write at the end of {}", self.log_path.display());
            log.set_len(log_len).map_err(|e| {
                IndexError::Io(format!("ftruncate({}) failed: {}", self.log_path.display(), e))
            })?;
        }

        let scope = Box::new(FileSync {
            index: self,
            log,
            view,
            log_len,
            replayed,
            transaction: IndexTransaction::new(),
        });
        if flags.require_changes && !replayed {
            debug!("Nothing to sync");
            Ok(SyncBegin::NothingToSync(Some(scope as Box<dyn IndexSync + '_>)))
        } else {
            Ok(SyncBegin::Started(scope as Box<dyn IndexSync + '_>))
        }
    }
}

impl MailIndex for FileIndex {
    fn view(&self) -> Result<IndexView, IndexError> {
        let result = match File::open(&self.log_path) {
            Ok(mut log) => self.load(&mut log).map(|(view, _, _)| view),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.read_snapshot().map(|snapshot| snapshot.view)
            }
            Err(e) => Err(IndexError::Io(format!(
                "open({}) failed: {}",
                self.log_path.display(),
                e
            ))),
        };
        self.record(result)
    }

    #[instrument(skip(self), level = "debug", fields(index = %self.index_path.display()))]
    fn sync_begin(&self, flags: IndexSyncFlags) -> Result<SyncBegin<'_>, IndexError> {
        let result = self.begin(flags);
        self.record(result)
    }

    fn reset_error(&self) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn log_path(&self) -> Option<&Path> {
        Some(&self.log_path)
    }
}

/// A held sync scope. Dropping it releases the lock.
struct FileSync<'a> {
    index: &'a FileIndex,
    log: File,
    view: IndexView,
    log_len: u64,
    replayed: bool,
    transaction: IndexTransaction,
}

impl FileSync<'_> {
    fn finish(mut self) -> Result<(), IndexError> {
        let changes = std::mem::take(&mut self.transaction).into_changes();
        if changes.is_empty() && !self.replayed {
            return Ok(());
        }

        let committed_len = self.log_len;
        if !changes.is_empty() {
            let mut line = serde_json::to_vec(&changes).map_err(|e| {
                IndexError::Serialization(format!("Failed to serialize changes: {}", e))
            })?;
            line.push(b'\n');
            self.log
                .write_all(&line)
                .and_then(|_| if self.index.fsync { self.log.sync_data() } else { Ok(()) })
                .map_err(|e| {
                    let path = self.index.log_path.display();
                    IndexError::Io(format!("write({}) failed: {}", path, e))
                })?;
            self.log_len += line.len() as u64;
            for change in &changes {
                self.view.apply(change);
            }
        }

        let snapshot = IndexFile {
            log_offset: self.log_len,
            view: std::mem::take(&mut self.view),
        };
        if let Err(e) = self.index.write_snapshot(&snapshot) {
            // readers would replay the line and see changes the caller was
            // told failed
            if self.log_len > committed_len {
                self.truncate_log(committed_len);
            }
            return Err(e);
        }
        debug!(
            "Committed {} changes to {}",
            changes.len(),
            self.index.index_path.display()
        );
        Ok(())
    }

    fn truncate_log(&mut self, len: u64) {
        let result = self.log.set_len(len).and_then(|_| {
            if self.index.fsync {
                self.log.sync_data()
            } else {
                Ok(())
            }
        });
        match result {
            Ok(()) => {
                debug!("Dropped uncommitted changes from {}", self.index.log_path.display());
                self.log_len = len;
            }
            Err(e) => warn!(
                "ftruncate({}) failed, uncommitted changes remain: {}",
                self.index.log_path.display(),
                e
            ),
        }
    }
}

impl IndexSync for FileSync<'_> {
    fn view(&self) -> &IndexView {
        &self.view
    }

    fn transaction(&mut self) -> &mut IndexTransaction {
        &mut self.transaction
    }

    fn commit(self: Box<Self>) -> Result<(), IndexError> {
        let index = self.index;
        let result = (*self).finish();
        index.record(result)
    }

    fn rollback(self: Box<Self>) {
        debug!(
            "Rolled back {} changes to {}",
            self.transaction.changes().len(),
            self.index.index_path.display()
        );
    }
}

impl Drop for FileSync<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.log);
    }
}

/// Size and modification time of a file, used to notice changes without
/// reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl FileStamp {
    /// `None` when the file doesn't exist.
    pub fn of(path: &Path) -> Option<Self> {
        fs::metadata(path).ok().map(|meta| Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}
