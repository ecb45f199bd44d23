//! Contract of the mailbox list, which maps mailbox names to paths.

use std::path::PathBuf;

/// Which of a mailbox's directories to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    /// The mailbox's own directory.
    Dir,
    /// Where message files live.
    Mailbox,
    /// Control files (uidvalidity counter, subscriptions).
    Control,
    /// Index files.
    Index,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListProps {
    /// Every directory is selectable, so `\Noselect` nodes don't exist and
    /// directory-only creation must still build an index.
    pub no_noselect: bool,
}

pub trait MailboxList: Send + Sync {
    fn hierarchy_sep(&self) -> char;

    fn props(&self) -> ListProps;

    /// Path of `path_type` for mailbox `name`, or the storage root when
    /// `name` is `None`.
    fn get_path(&self, name: Option<&str>, path_type: PathType) -> PathBuf;

    /// Prefix shared by every temporary file any process writes under this
    /// list. Old files with it belong to crashed writers.
    fn global_temp_prefix(&self) -> &str;

    fn is_valid_name(&self, name: &str) -> bool;
}
