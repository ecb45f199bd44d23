//! Contract of the index engine consumed by backends.
//!
//! The engine owns the on-disk index. Backends only read views, open sync
//! scopes, buffer changes into the scope's transaction and commit or roll back.
//! The engine guarantees that at most one sync scope is active per index at a
//! time, across processes. Mailbox creation relies on that guarantee as its
//! only lock.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexError;
use crate::types::MailFlags;

/// Index header. `uid_validity == 0` means the index was never initialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub uid_validity: u32,
    pub next_uid: u32,
    pub messages_count: u32,
    /// Messages with a UID at or above this are recent.
    pub first_recent_uid: u32,
    /// Keyword names known to this index.
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Per-message record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub uid: u32,
    pub flags: MailFlags,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub received_date: DateTime<Utc>,
    #[serde(default)]
    pub from_envelope: Option<String>,
    pub size: u64,
}

/// A consistent snapshot of an index. Records are ordered by UID; the
/// sequence number of a record is its position + 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexView {
    pub header: IndexHeader,
    #[serde(default)]
    pub records: Vec<IndexRecord>,
}

impl IndexView {
    pub fn seq_of(&self, uid: u32) -> Option<u32> {
        self.records
            .binary_search_by_key(&uid, |r| r.uid)
            .ok()
            .map(|pos| pos as u32 + 1)
    }

    pub fn record(&self, seq: u32) -> Option<&IndexRecord> {
        seq.checked_sub(1).and_then(|i| self.records.get(i as usize))
    }

    /// Apply one committed change.
    pub fn apply(&mut self, change: &IndexChange) {
        match change {
            IndexChange::Header(header) => {
                self.header = header.clone();
            }
            IndexChange::Append(record) => {
                if self.header.next_uid <= record.uid {
                    self.header.next_uid = record.uid.saturating_add(1);
                }
                for keyword in &record.keywords {
                    if !self.header.keywords.contains(keyword) {
                        self.header.keywords.push(keyword.clone());
                    }
                }
                match self.records.binary_search_by_key(&record.uid, |r| r.uid) {
                    Ok(pos) => self.records[pos] = record.clone(),
                    Err(pos) => self.records.insert(pos, record.clone()),
                }
            }
            IndexChange::Flags { uid, flags, keywords } => {
                if let Ok(pos) = self.records.binary_search_by_key(uid, |r| r.uid) {
                    self.records[pos].flags = *flags;
                    self.records[pos].keywords = keywords.clone();
                }
                for keyword in keywords {
                    if !self.header.keywords.contains(keyword) {
                        self.header.keywords.push(keyword.clone());
                    }
                }
            }
            IndexChange::Expunge { uid } => {
                if let Ok(pos) = self.records.binary_search_by_key(uid, |r| r.uid) {
                    self.records.remove(pos);
                }
            }
        }
        self.header.messages_count = self.records.len() as u32;
    }
}

/// One buffered modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IndexChange {
    Header(IndexHeader),
    Append(IndexRecord),
    Flags {
        uid: u32,
        flags: MailFlags,
        keywords: Vec<String>,
    },
    Expunge {
        uid: u32,
    },
}

/// Changes buffered inside a sync scope. Nothing reaches disk until the
/// scope commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexTransaction {
    changes: Vec<IndexChange>,
}

impl IndexTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_header(&mut self, header: IndexHeader) {
        self.changes.push(IndexChange::Header(header));
    }

    pub fn append(&mut self, record: IndexRecord) {
        self.changes.push(IndexChange::Append(record));
    }

    pub fn update_flags(&mut self, uid: u32, flags: MailFlags, keywords: Vec<String>) {
        self.changes.push(IndexChange::Flags {
            uid,
            flags,
            keywords,
        });
    }

    pub fn expunge(&mut self, uid: u32) {
        self.changes.push(IndexChange::Expunge { uid });
    }

    pub fn changes(&self) -> &[IndexChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<IndexChange> {
        self.changes
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSyncFlags {
    /// Report [`SyncBegin::NothingToSync`] when there is nothing pending.
    pub require_changes: bool,
}

/// An open sync scope. Holding one excludes every other sync scope on the
/// same index until it is committed or rolled back.
pub trait IndexSync {
    /// The view as of the moment the scope was acquired.
    fn view(&self) -> &IndexView;

    fn header(&self) -> &IndexHeader {
        &self.view().header
    }

    fn transaction(&mut self) -> &mut IndexTransaction;

    fn commit(self: Box<Self>) -> Result<(), IndexError>;

    /// Discard the buffered changes. On-disk state is left as it was when
    /// the scope began.
    fn rollback(self: Box<Self>);
}

/// Result of [`MailIndex::sync_begin`].
pub enum SyncBegin<'a> {
    Started(Box<dyn IndexSync + 'a>),
    /// Nothing to synchronize. Engines that keep the scope open anyway hand
    /// it back; a `None` here leaves no view to inspect.
    NothingToSync(Option<Box<dyn IndexSync + 'a>>),
}

pub trait MailIndex: Send + Sync {
    /// Snapshot of the committed state.
    fn view(&self) -> Result<IndexView, IndexError>;

    /// Acquire the index's sync scope, blocking while another holder has it.
    fn sync_begin(&self, flags: IndexSyncFlags) -> Result<SyncBegin<'_>, IndexError>;

    /// Forget the last failure so later attempts start clean.
    fn reset_error(&self);

    fn last_error(&self) -> Option<String>;

    /// File that changes on every commit, if the engine has one.
    fn log_path(&self) -> Option<&Path>;
}
