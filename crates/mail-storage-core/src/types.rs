use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// Storage configuration
// =============================================================================

/// Flags passed to a backend when constructing a storage instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageFlags {
    pub debug: bool,
    pub fsync_disable: bool,
    /// Don't create the root directory if it is missing.
    pub no_autocreate: bool,
}

/// How index files are locked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMethod {
    Fcntl,
    #[default]
    Flock,
    Dotlock,
}

impl fmt::Display for LockMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMethod::Fcntl => write!(f, "fcntl"),
            LockMethod::Flock => write!(f, "flock"),
            LockMethod::Dotlock => write!(f, "dotlock"),
        }
    }
}

impl FromStr for LockMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fcntl" => Ok(LockMethod::Fcntl),
            "flock" => Ok(LockMethod::Flock),
            "dotlock" => Ok(LockMethod::Dotlock),
            other => Err(format!("Unknown lock method: {}", other)),
        }
    }
}

/// Everything a backend needs besides its data string.
#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
    pub user: Option<String>,
    pub flags: StorageFlags,
    pub lock_method: LockMethod,
}

/// Hooks a caller can install on a storage instance.
pub trait StorageCallbacks: Send + Sync {
    /// Informational notice for the user.
    fn notify_ok(&self, _text: &str) {}

    /// Warning for the user; the operation continued in a degraded mode.
    fn notify_no(&self, _text: &str) {}
}

// =============================================================================
// Mailbox names and listing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxNameStatus {
    Exists,
    NoExist,
    Invalid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListFlags {
    /// Only return subscribed mailboxes.
    pub subscribed_only: bool,
    /// Skip the children lookup.
    pub fast: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxInfo {
    pub name: String,
    /// Directory only, cannot be opened.
    pub noselect: bool,
    /// `None` when listed with [`ListFlags::fast`].
    pub children: Option<bool>,
    pub subscribed: bool,
}

// =============================================================================
// Open / status
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub readonly: bool,
    /// Don't read the message list until the first sync.
    pub fast: bool,
    /// Don't move the recent marker when opening.
    pub keep_recent: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusItems {
    pub messages: bool,
    pub recent: bool,
    pub uidnext: bool,
    pub uidvalidity: bool,
    pub unseen: bool,
    pub keywords: bool,
}

impl StatusItems {
    pub fn all() -> Self {
        Self {
            messages: true,
            recent: true,
            uidnext: true,
            uidvalidity: true,
            unseen: true,
            keywords: true,
        }
    }
}

/// Mailbox counters. Fields not requested through [`StatusItems`] are zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStatus {
    pub messages: u32,
    pub recent: u32,
    pub unseen: u32,
    pub uidvalidity: u32,
    pub uidnext: u32,
    /// Sequence number of the first unseen message, 0 if none.
    pub first_unseen_seq: u32,
    pub keywords: Vec<String>,
}

// =============================================================================
// Flags, keywords, mails
// =============================================================================

/// System flags of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MailFlags(u8);

impl MailFlags {
    pub const ANSWERED: MailFlags = MailFlags(0x01);
    pub const FLAGGED: MailFlags = MailFlags(0x02);
    pub const DELETED: MailFlags = MailFlags(0x04);
    pub const SEEN: MailFlags = MailFlags(0x08);
    pub const DRAFT: MailFlags = MailFlags(0x10);
    pub const RECENT: MailFlags = MailFlags(0x20);

    pub const fn empty() -> Self {
        MailFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: MailFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: MailFlags) -> Self {
        MailFlags(self.0 | other.0)
    }

    pub const fn difference(self, other: MailFlags) -> Self {
        MailFlags(self.0 & !other.0)
    }

    pub fn insert(&mut self, other: MailFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: MailFlags) {
        self.0 &= !other.0;
    }
}

/// How an update combines with the existing flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyType {
    Add,
    Remove,
    Replace,
}

/// Validated keyword set, created through a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keywords(Vec<String>);

impl Keywords {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A message as returned by search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub seq: u32,
    pub uid: u32,
    pub flags: MailFlags,
    pub keywords: Vec<String>,
    pub received_date: chrono::DateTime<chrono::Utc>,
    pub from_envelope: Option<String>,
    pub size: u64,
    pub data: Vec<u8>,
}

/// Input for a new message.
pub struct SaveRequest<'a> {
    pub flags: MailFlags,
    pub keywords: Option<Keywords>,
    pub received_date: Option<chrono::DateTime<chrono::Utc>>,
    /// Minutes east of UTC.
    pub timezone_offset: i32,
    pub from_envelope: Option<String>,
    pub input: Box<dyn Read + 'a>,
}

impl<'a> SaveRequest<'a> {
    pub fn new(input: impl Read + 'a) -> Self {
        Self {
            flags: MailFlags::empty(),
            keywords: None,
            received_date: None,
            timezone_offset: 0,
            from_envelope: None,
            input: Box::new(input),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionFlags {
    /// Changes come from outside the session; saved mails aren't recent.
    pub external: bool,
}

// =============================================================================
// Sync
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncFlags {
    /// Remove messages flagged `\Deleted`.
    pub expunge: bool,
    /// Only report what is cheap to find out.
    pub fast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Expunge,
    Flags,
    Keywords,
}

/// One change observed by a sync.
///
/// Expunges come first, highest sequence number first, so each can be
/// applied as it arrives. Flag and keyword changes that follow use the
/// sequence numbers left after those expunges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRecord {
    pub seq1: u32,
    pub seq2: u32,
    pub sync_type: SyncType,
}

/// Called with the mailbox name when its index changed on disk.
pub type NotifyCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Minimum interval used when a caller asks for zero.
pub const MIN_NOTIFY_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Search
// =============================================================================

/// Inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    pub first: u32,
    pub last: u32,
}

impl SeqRange {
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, value: u32) -> bool {
        value >= self.first && value <= self.last
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchArg {
    All,
    Uid(SeqRange),
    Seq(SeqRange),
    Flag(MailFlags),
    Keyword(String),
    Not(Box<SearchArg>),
    Or(Box<SearchArg>, Box<SearchArg>),
}

impl SearchArg {
    /// Whether `mail` matches this argument.
    pub fn matches(&self, mail: &Mail) -> bool {
        match self {
            SearchArg::All => true,
            SearchArg::Uid(range) => range.contains(mail.uid),
            SearchArg::Seq(range) => range.contains(mail.seq),
            SearchArg::Flag(flags) => mail.flags.contains(*flags),
            SearchArg::Keyword(name) => mail.keywords.iter().any(|k| k.eq_ignore_ascii_case(name)),
            SearchArg::Not(inner) => !inner.matches(mail),
            SearchArg::Or(a, b) => a.matches(mail) || b.matches(mail),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortType {
    Arrival,
    Date,
    Size,
    From,
    Subject,
}

// =============================================================================
// Header lookup
// =============================================================================

/// Prepared set of header fields to look up in mails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLookup {
    mailbox: String,
    fields: Vec<String>,
}

impl HeaderLookup {
    pub fn new(mailbox: &str, fields: &[&str]) -> Self {
        Self {
            mailbox: mailbox.to_string(),
            fields: fields.iter().map(|f| f.to_ascii_lowercase()).collect(),
        }
    }

    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// The requested header lines of `mail`, unfolded, in message order.
    pub fn lookup(&self, mail: &Mail) -> Vec<(String, String)> {
        let text = String::from_utf8_lossy(&mail.data);
        let mut found: Vec<(String, String)> = Vec::new();
        let mut current: Option<(String, String)> = None;

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, value)) = current.as_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some(done) = current.take() {
                found.push(done);
            }
            if let Some((name, value)) = line.split_once(':') {
                if self.fields.iter().any(|f| f.eq_ignore_ascii_case(name.trim())) {
                    current = Some((name.trim().to_string(), value.trim().to_string()));
                }
            }
        }
        if let Some(done) = current.take() {
            found.push(done);
        }
        found
    }
}
