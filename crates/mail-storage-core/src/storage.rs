use std::io::Read;
use std::sync::Arc;

use crate::error::StorageError;
use crate::error_state::ErrorState;
use crate::mailbox::{Mailbox, MailboxHandle};
use crate::types::{ListFlags, MailboxInfo, MailboxNameStatus, OpenFlags, StorageCallbacks};

/// A live storage instance of one backend.
///
/// Every failing method has already stored its caller-facing message in
/// [`errors`](MailStorage::errors) when it returns; the returned
/// [`StorageError`] carries the same text.
pub trait MailStorage: Send + Sync {
    /// Name of the backend that built this instance (e.g., "dbox").
    fn backend_name(&self) -> &'static str;

    fn errors(&self) -> &ErrorState;

    fn hierarchy_sep(&self) -> char;

    fn set_callbacks(&self, callbacks: Arc<dyn StorageCallbacks>);

    // =========================================================================
    // Mailbox management
    // =========================================================================

    /// Create a mailbox. With `directory` set only a hierarchy node is
    /// created, unless the layout has no such thing as a non-selectable node.
    fn mailbox_create(&self, name: &str, directory: bool) -> Result<(), StorageError>;

    fn mailbox_delete(&self, name: &str) -> Result<(), StorageError>;

    fn mailbox_rename(&self, old_name: &str, new_name: &str) -> Result<(), StorageError>;

    /// Mailboxes matching `reference` + `mask`. `*` matches anything, `%`
    /// anything except the hierarchy separator.
    fn mailbox_list(
        &self,
        reference: &str,
        mask: &str,
        flags: ListFlags,
    ) -> Result<Vec<MailboxInfo>, StorageError>;

    fn set_subscribed(&self, name: &str, subscribed: bool) -> Result<(), StorageError>;

    fn is_subscribed(&self, name: &str) -> Result<bool, StorageError>;

    fn mailbox_name_status(&self, name: &str) -> Result<MailboxNameStatus, StorageError>;

    // =========================================================================
    // Open
    // =========================================================================

    /// Open a mailbox. `input` is only meaningful for stream-backed formats.
    fn mailbox_open(
        &self,
        name: &str,
        input: Option<Box<dyn Read + Send>>,
        flags: OpenFlags,
    ) -> Result<Box<dyn Mailbox + '_>, StorageError>;

    /// The last error and whether it is a syntax error.
    fn get_last_error(&self) -> (Option<String>, bool) {
        self.errors().get_last_error()
    }
}

impl dyn MailStorage + '_ {
    /// Open a mailbox behind the guarded dispatch handle.
    pub fn open(
        &self,
        name: &str,
        input: Option<Box<dyn Read + Send>>,
        flags: OpenFlags,
    ) -> Result<MailboxHandle<'_>, StorageError> {
        let mailbox = self.mailbox_open(name, input, flags)?;
        Ok(MailboxHandle::new(self, mailbox))
    }
}
