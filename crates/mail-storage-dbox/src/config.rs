use clap::{Parser, Subcommand};
use mail_storage_core::{LockMethod, StorageFlags, StorageSettings};

/// Configuration for the mail-storage-dbox tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "mail-storage-dbox")]
#[command(about = "Maintenance tool for dbox mail storages")]
pub struct Config {
    /// Storage location: "dbox:PATH", a bare path to autodetect, or
    /// empty for the default location (~/dbox)
    #[arg(long, default_value = "", env = "MAIL_LOCATION")]
    pub mail_location: String,

    /// User the storage belongs to
    #[arg(long, env = "USER")]
    pub user: Option<String>,

    /// Index locking method: fcntl, flock or dotlock. dbox only supports flock
    #[arg(long, default_value = "flock")]
    pub lock_method: LockMethod,

    /// Log backend decisions (autodetection, etc.)
    #[arg(long)]
    pub debug: bool,

    /// Skip fsync after writes
    #[arg(long)]
    pub fsync_disable: bool,

    /// Fail instead of creating a missing root directory
    #[arg(long)]
    pub no_autocreate: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    pub fn settings(&self) -> StorageSettings {
        StorageSettings {
            user: self.user.clone(),
            flags: StorageFlags {
                debug: self.debug,
                fsync_disable: self.fsync_disable,
                no_autocreate: self.no_autocreate,
            },
            lock_method: self.lock_method,
        }
    }

    /// The location with any `dbox:` prefix removed, `None` when empty.
    pub fn dbox_data(&self) -> Option<&str> {
        let location = self.mail_location.as_str();
        let data = match location.split_once(':') {
            Some((name, rest)) if name.eq_ignore_ascii_case("dbox") => rest,
            _ => location,
        };
        (!data.is_empty()).then_some(data)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a mailbox
    Create {
        name: String,
        /// Only create a hierarchy node that can hold other mailboxes
        #[arg(long)]
        directory: bool,
    },
    /// Delete a mailbox
    Delete { name: String },
    /// Rename a mailbox
    Rename { old_name: String, new_name: String },
    /// List mailboxes matching a pattern
    List {
        /// Pattern; "*" matches anything, "%" anything but "/"
        #[arg(default_value = "*")]
        mask: String,
        #[arg(long, default_value = "")]
        reference: String,
        /// Only list subscribed mailboxes
        #[arg(long)]
        subscribed: bool,
    },
    /// Print a mailbox's status as JSON
    Status { name: String },
    Subscribe { name: String },
    Unsubscribe { name: String },
    /// Remove stale temporary files from a mailbox now
    Sweep { name: String },
}
