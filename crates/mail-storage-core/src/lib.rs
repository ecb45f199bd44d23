//! Backend-independent core of the mail storage engine.
//!
//! A [`StorageRegistry`] resolves a storage location to a backend's
//! [`MailStorage`] instance. Mailboxes opened through
//! [`open`](MailStorage::open) are [`MailboxHandle`]s that guard every call
//! against closed and read-only use before dispatching to the backend.
//! Failures land in the instance's [`ErrorState`], which keeps internal
//! detail out of caller-visible messages.

pub mod error;
pub mod error_state;
pub mod index;
pub mod list;
pub mod mailbox;
pub mod registry;
pub mod storage;
pub mod types;

pub use error::{IndexError, RegistryError, StorageError};
pub use error_state::{ErrorState, LastError, CRITICAL_MSG};
pub use index::{
    IndexChange, IndexHeader, IndexRecord, IndexSync, IndexSyncFlags, IndexTransaction,
    IndexView, MailIndex, SyncBegin,
};
pub use list::{ListProps, MailboxList, PathType};
pub use mailbox::{
    MailSave, MailSearch, Mailbox, MailboxHandle, MailboxSync, MailboxTransaction, Transaction,
};
pub use registry::{StorageClass, StorageRegistry};
pub use storage::MailStorage;
pub use types::*;
