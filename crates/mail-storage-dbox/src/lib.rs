//! dbox: a directory-of-files mail storage backend.
//!
//! Each mailbox is a directory holding a file-backed index
//! ([`FileIndex`]) and one file per message. Register [`DboxClass`] with a
//! [`StorageRegistry`](mail_storage_core::StorageRegistry) to make the
//! backend available by name (`dbox:PATH`) and by autodetection.

pub mod bootstrap;
pub mod index;
pub mod list;
pub mod mailbox;
pub mod reclaim;
pub mod storage;
pub mod uidvalidity;
pub mod watch;

pub use index::{FileIndex, FileStamp, INDEX_FILE_NAME, LOG_FILE_NAME};
pub use list::{FsMailboxList, ListSettings, GLOBAL_TEMP_PREFIX, MAILDIR_NAME};
pub use mailbox::{DboxMailbox, DboxTransaction};
pub use reclaim::{ReclaimPolicy, ScanDecision};
pub use storage::{DboxClass, DboxLocation, DboxStorage, LocationError, DBOX_STORAGE_NAME};
