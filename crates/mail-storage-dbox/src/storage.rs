use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use mail_storage_core::{
    ErrorState, ListFlags, LockMethod, MailStorage, Mailbox, MailboxInfo, MailboxList,
    MailboxNameStatus, OpenFlags, PathType, StorageCallbacks, StorageClass, StorageError,
    StorageFlags, StorageSettings,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::index::INDEX_FILE_NAME;
use crate::list::{pattern_matches, FsMailboxList, ListSettings, MAILBOX_DIR_NAME};
use crate::mailbox::{DboxMailbox, OpenMode};
use crate::reclaim::{self, ReclaimPolicy};

pub const DBOX_STORAGE_NAME: &str = "dbox";
/// Directory under the home directory used when no location is given.
pub const DEFAULT_ROOT_NAME: &str = "dbox";

/// Errors parsing a dbox location (`ROOT[:INDEX=DIR][:CONTROL=DIR]`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("Empty root directory in mail location")]
    EmptyRoot,

    #[error("Unknown setting in mail location: {0}")]
    UnknownSetting(String),

    #[error("Invalid setting in mail location: {0}")]
    InvalidSetting(String),
}

/// Where a dbox storage lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DboxLocation {
    pub root: PathBuf,
    pub index: Option<PathBuf>,
    pub control: Option<PathBuf>,
}

impl DboxLocation {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            index: None,
            control: None,
        }
    }

    pub fn parse(data: &str) -> Result<Self, LocationError> {
        let mut parts = data.split(':');
        let root = parts.next().unwrap_or_default();
        if root.is_empty() {
            return Err(LocationError::EmptyRoot);
        }
        let mut location = Self::new(expand_home(root));
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| LocationError::InvalidSetting(part.to_string()))?;
            if value.is_empty() {
                return Err(LocationError::InvalidSetting(part.to_string()));
            }
            match key.to_ascii_uppercase().as_str() {
                "INDEX" => location.index = Some(expand_home(value)),
                "CONTROL" => location.control = Some(expand_home(value)),
                _ => return Err(LocationError::UnknownSetting(key.to_string())),
            }
        }
        Ok(location)
    }

    pub fn list_settings(&self) -> ListSettings {
        let mut settings = ListSettings::new(&self.root);
        settings.index_dir = self.index.clone();
        settings.control_dir = self.control.clone();
        settings
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

fn is_dbox_root(root: &Path) -> bool {
    root.join(MAILBOX_DIR_NAME).is_dir()
}

/// The dbox backend as seen by the registry.
#[derive(Debug, Default)]
pub struct DboxClass {
    policy: ReclaimPolicy,
}

impl DboxClass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: ReclaimPolicy) -> Self {
        Self { policy }
    }

    /// `~/dbox`, if there is a home directory.
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_ROOT_NAME))
    }

    /// Build a concrete storage. `data == None` uses [`default_root`]
    /// (Self::default_root), and only if a dbox tree already exists there.
    ///
    /// Index files are locked with `flock`; any other lock method is refused.
    #[instrument(
        skip(self, settings),
        level = "debug",
        fields(user = ?settings.user, lock_method = %settings.lock_method)
    )]
    pub fn open(
        &self,
        data: Option<&str>,
        settings: &StorageSettings,
    ) -> Result<DboxStorage, StorageError> {
        let errors = ErrorState::new();
        if settings.lock_method != LockMethod::Flock {
            return Err(errors.syntax(format!(
                "dbox only supports lock_method=flock, not {}",
                settings.lock_method
            )));
        }
        let location = match data {
            Some(data) => DboxLocation::parse(data).map_err(|e| errors.syntax(e.to_string()))?,
            None => {
                let root = Self::default_root()
                    .filter(|root| is_dbox_root(root))
                    .ok_or_else(|| errors.not_found("No dbox storage in the home directory"))?;
                DboxLocation::new(root)
            }
        };

        let mailboxes = location.root.join(MAILBOX_DIR_NAME);
        if !mailboxes.is_dir() {
            if settings.flags.no_autocreate {
                return Err(errors.not_found("Root mail directory doesn't exist"));
            }
            fs::create_dir_all(&mailboxes).map_err(|e| {
                errors.io("mkdir", &mailboxes, &e, || {
                    "Root mail directory doesn't exist".into()
                })
            })?;
            info!("Created dbox root {}", location.root.display());
        }

        let list = FsMailboxList::new(location.list_settings());
        Ok(DboxStorage::new(list, settings.clone(), self.policy, errors))
    }
}

impl StorageClass for DboxClass {
    fn name(&self) -> &'static str {
        DBOX_STORAGE_NAME
    }

    fn autodetect(&self, data: &str, flags: StorageFlags) -> bool {
        let root = expand_home(data.split(':').next().unwrap_or_default());
        let found = is_dbox_root(&root);
        if flags.debug {
            debug!("dbox autodetect: {} found={}", root.display(), found);
        }
        found
    }

    fn create(
        &self,
        data: Option<&str>,
        settings: &StorageSettings,
    ) -> Result<Box<dyn MailStorage>, StorageError> {
        Ok(Box::new(self.open(data, settings)?))
    }
}

/// State shared by a storage instance and the mailboxes opened from it.
pub(crate) struct StorageShared {
    pub(crate) list: FsMailboxList,
    pub(crate) settings: StorageSettings,
    pub(crate) errors: ErrorState,
    pub(crate) policy: ReclaimPolicy,
    callbacks: Mutex<Option<Arc<dyn StorageCallbacks>>>,
}

impl StorageShared {
    fn callbacks(&self) -> Option<Arc<dyn StorageCallbacks>> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn notify_ok(&self, text: &str) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.notify_ok(text);
        }
    }

    pub(crate) fn notify_no(&self, text: &str) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.notify_no(text);
        }
    }

    /// Whether `name` has an index or a message directory, i.e., can be
    /// opened rather than only listed.
    pub(crate) fn is_selectable(&self, name: &str) -> bool {
        self.list
            .get_path(Some(name), PathType::Index)
            .join(INDEX_FILE_NAME)
            .exists()
            || self.list.get_path(Some(name), PathType::Mailbox).is_dir()
    }
}

/// A dbox storage instance. Dropping it destroys it.
pub struct DboxStorage {
    shared: Arc<StorageShared>,
}

impl DboxStorage {
    pub(crate) fn new(
        list: FsMailboxList,
        settings: StorageSettings,
        policy: ReclaimPolicy,
        errors: ErrorState,
    ) -> Self {
        Self {
            shared: Arc::new(StorageShared {
                list,
                settings,
                errors,
                policy,
                callbacks: Mutex::new(None),
            }),
        }
    }

    pub fn list(&self) -> &FsMailboxList {
        &self.shared.list
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.shared.settings
    }

    fn check_name(&self, name: &str) -> Result<(), StorageError> {
        if self.shared.list.is_valid_name(name) {
            Ok(())
        } else {
            Err(self
                .shared
                .errors
                .syntax(format!("Invalid mailbox name: {}", name)))
        }
    }

    fn not_found(&self, name: &str) -> StorageError {
        self.shared
            .errors
            .not_found(format!("Mailbox doesn't exist: {}", name))
    }

    fn io_error(&self, op: &str, path: &Path, err: &io::Error, name: &str) -> StorageError {
        self.shared
            .errors
            .io(op, path, err, || format!("Mailbox doesn't exist: {}", name))
    }

    /// Remove stale temp files of `name` now, skipping the heuristic.
    /// Returns how many were removed.
    #[instrument(skip(self), level = "debug")]
    pub fn sweep_temp_files(&self, name: &str) -> Result<usize, StorageError> {
        self.check_name(name)?;
        let dir = self.shared.list.get_path(Some(name), PathType::Dir);
        fs::metadata(&dir).map_err(|e| self.io_error("stat", &dir, &e, name))?;

        let cutoff = SystemTime::now()
            .checked_sub(self.shared.policy.quiet_period)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let removed = reclaim::sweep(&dir, self.shared.list.global_temp_prefix(), cutoff);
        if removed > 0 {
            self.shared
                .notify_ok(&format!("Removed {} stale temporary files", removed));
        }
        Ok(removed)
    }

    fn read_subscriptions(&self) -> Result<Vec<String>, StorageError> {
        let path = self.shared.list.subscriptions_path();
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(self.shared.errors.io("open", &path, &e, String::new)),
        }
    }

    fn write_subscriptions(&self, names: &[String]) -> Result<(), StorageError> {
        let path = self.shared.list.subscriptions_path();
        let mut content = names.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }

        // Write atomically via temp file
        let temp_path = path.with_file_name(self.shared.list.temp_file_name());
        let result = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(&temp_path, &content))
            .and_then(|_| fs::rename(&temp_path, &path));
        result.map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            self.shared
                .errors
                .critical(format_args!("Failed to write {}: {}", path.display(), e))
        })
    }
}

impl MailStorage for DboxStorage {
    fn backend_name(&self) -> &'static str {
        DBOX_STORAGE_NAME
    }

    fn errors(&self) -> &ErrorState {
        &self.shared.errors
    }

    fn hierarchy_sep(&self) -> char {
        self.shared.list.hierarchy_sep()
    }

    fn set_callbacks(&self, callbacks: Arc<dyn StorageCallbacks>) {
        *self
            .shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callbacks);
    }

    // =========================================================================
    // Mailbox management
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    fn mailbox_create(&self, name: &str, directory: bool) -> Result<(), StorageError> {
        self.check_name(name)?;
        let dir = self.shared.list.get_path(Some(name), PathType::Dir);
        if dir.is_dir() && (directory || self.shared.is_selectable(name)) {
            return Err(self.shared.errors.already_exists("Mailbox already exists"));
        }

        fs::create_dir_all(&dir).map_err(|e| self.io_error("mkdir", &dir, &e, name))?;
        if directory && !self.shared.list.props().no_noselect {
            debug!("Created directory {}", name);
            return Ok(());
        }

        let mut mailbox = DboxMailbox::open(
            Arc::clone(&self.shared),
            name,
            OpenFlags::default(),
            OpenMode::Create,
        )?;
        let initialized = mailbox.create_indexes()?;
        Box::new(mailbox).close()?;
        info!("Created mailbox {} (initialized={})", name, initialized);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn mailbox_delete(&self, name: &str) -> Result<(), StorageError> {
        self.check_name(name)?;
        let list = &self.shared.list;
        let dir = list.get_path(Some(name), PathType::Dir);
        if !dir.is_dir() {
            return Err(self.not_found(name));
        }

        let has_children = list
            .has_children(name)
            .map_err(|e| self.io_error("readdir", &dir, &e, name))?;
        if has_children {
            if !self.shared.is_selectable(name) {
                return Err(self
                    .shared
                    .errors
                    .already_exists("Mailbox has children, delete them first"));
            }
            // keep the directory for the children, drop the mailbox itself
            let mail_dir = list.get_path(Some(name), PathType::Mailbox);
            let index_dir = list.get_path(Some(name), PathType::Index);
            let targets = [
                mail_dir,
                index_dir.join(INDEX_FILE_NAME),
                index_dir.join(crate::index::LOG_FILE_NAME),
            ];
            for target in targets {
                let result = if target.is_dir() {
                    fs::remove_dir_all(&target)
                } else {
                    fs::remove_file(&target)
                };
                match result {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(self.io_error("unlink", &target, &e, name)),
                }
            }
        } else {
            for path in list.mailbox_dirs(name) {
                match fs::remove_dir_all(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(self.io_error("rmdir", &path, &e, name)),
                }
            }
        }

        info!("Deleted mailbox {}", name);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn mailbox_rename(&self, old_name: &str, new_name: &str) -> Result<(), StorageError> {
        self.check_name(old_name)?;
        self.check_name(new_name)?;
        let sep = self.shared.list.hierarchy_sep();
        if new_name.starts_with(&format!("{}{}", old_name, sep)) {
            return Err(self
                .shared
                .errors
                .syntax("Can't move mailbox under its own child"));
        }

        let list = &self.shared.list;
        if !list.get_path(Some(old_name), PathType::Dir).is_dir() {
            return Err(self.not_found(old_name));
        }
        if list.get_path(Some(new_name), PathType::Dir).exists() {
            return Err(self
                .shared
                .errors
                .already_exists("Target mailbox already exists"));
        }

        for (from, to) in list
            .mailbox_dirs(old_name)
            .into_iter()
            .zip(list.mailbox_dirs(new_name))
        {
            if !from.exists() {
                continue;
            }
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| self.io_error("mkdir", parent, &e, new_name))?;
            }
            fs::rename(&from, &to).map_err(|e| self.io_error("rename", &from, &e, old_name))?;
        }

        info!("Renamed mailbox {} to {}", old_name, new_name);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn mailbox_list(
        &self,
        reference: &str,
        mask: &str,
        flags: ListFlags,
    ) -> Result<Vec<MailboxInfo>, StorageError> {
        let pattern = format!("{}{}", reference, mask);
        let subscriptions = self.read_subscriptions()?;
        let list = &self.shared.list;

        let names: Vec<String> = if flags.subscribed_only {
            subscriptions.clone()
        } else {
            let root = list.mailboxes_dir();
            list.walk()
                .map_err(|e| self.shared.errors.io("readdir", &root, &e, String::new))?
        };

        let mut infos = Vec::new();
        for name in names {
            if !pattern_matches(&pattern, &name) {
                continue;
            }
            let exists = list.get_path(Some(&name), PathType::Dir).is_dir();
            let children = if flags.fast || !exists {
                None
            } else {
                match list.has_children(&name) {
                    Ok(children) => Some(children),
                    // removed while we were listing
                    Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                    Err(e) => {
                        let dir = list.get_path(Some(&name), PathType::Dir);
                        return Err(self.io_error("readdir", &dir, &e, &name));
                    }
                }
            };
            infos.push(MailboxInfo {
                noselect: !exists || !self.shared.is_selectable(&name),
                subscribed: subscriptions.contains(&name),
                children,
                name,
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    fn set_subscribed(&self, name: &str, subscribed: bool) -> Result<(), StorageError> {
        self.check_name(name)?;
        let mut names = self.read_subscriptions()?;
        let present = names.iter().any(|n| n == name);
        match (present, subscribed) {
            (false, true) => names.push(name.to_string()),
            (true, false) => names.retain(|n| n != name),
            _ => return Ok(()),
        }
        self.write_subscriptions(&names)?;
        debug!("Set subscription of {} to {}", name, subscribed);
        Ok(())
    }

    fn is_subscribed(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.read_subscriptions()?.iter().any(|n| n == name))
    }

    fn mailbox_name_status(&self, name: &str) -> Result<MailboxNameStatus, StorageError> {
        if !self.shared.list.is_valid_name(name) {
            return Ok(MailboxNameStatus::Invalid);
        }
        let dir = self.shared.list.get_path(Some(name), PathType::Dir);
        match fs::metadata(&dir) {
            Ok(_) => Ok(MailboxNameStatus::Exists),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(MailboxNameStatus::NoExist),
            Err(e) => Err(self.io_error("stat", &dir, &e, name)),
        }
    }

    // =========================================================================
    // Open
    // =========================================================================

    fn mailbox_open(
        &self,
        name: &str,
        input: Option<Box<dyn io::Read + Send>>,
        flags: OpenFlags,
    ) -> Result<Box<dyn Mailbox + '_>, StorageError> {
        if input.is_some() {
            return Err(self
                .shared
                .errors
                .syntax("dbox doesn't support streamed mailboxes"));
        }
        self.check_name(name)?;
        let mailbox = DboxMailbox::open(Arc::clone(&self.shared), name, flags, OpenMode::Select)?;
        Ok(Box::new(mailbox))
    }
}

impl Drop for DboxStorage {
    fn drop(&mut self) {
        debug!("Destroyed dbox storage at {}", self.shared.list.root_dir().display());
    }
}
