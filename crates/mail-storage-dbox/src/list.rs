use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use mail_storage_core::{ListProps, MailboxList, PathType};
use tracing::debug;

/// Subscriptions file in the control root.
pub const SUBSCRIPTION_FILE_NAME: &str = "subscriptions";
/// Directory under the root holding the mailbox tree.
pub const MAILBOX_DIR_NAME: &str = "mailboxes";
/// Directory inside each mailbox holding message files.
pub const MAILDIR_NAME: &str = "dbox-Mails";
/// Prefix of every temporary file written under the root.
pub const GLOBAL_TEMP_PREFIX: &str = ".temp.";

pub const HIERARCHY_SEP: char = '/';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Layout {
    /// Mailbox `a/b` lives in directory `mailboxes/a/b`.
    #[default]
    Fs,
}

/// Where things live. Unset fields get dbox defaults in
/// [`apply_dbox_defaults`](ListSettings::apply_dbox_defaults).
#[derive(Debug, Clone, Default)]
pub struct ListSettings {
    pub root_dir: PathBuf,
    pub index_dir: Option<PathBuf>,
    pub control_dir: Option<PathBuf>,
    pub layout: Option<Layout>,
    pub subscription_fname: Option<String>,
    pub maildir_name: Option<String>,
    pub mailbox_dir_name: Option<String>,
    /// Every directory is a selectable mailbox.
    pub no_noselect: bool,
}

impl ListSettings {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn apply_dbox_defaults(&mut self) {
        self.layout.get_or_insert(Layout::Fs);
        self.subscription_fname
            .get_or_insert_with(|| SUBSCRIPTION_FILE_NAME.to_string());
        self.maildir_name
            .get_or_insert_with(|| MAILDIR_NAME.to_string());
        self.mailbox_dir_name
            .get_or_insert_with(|| MAILBOX_DIR_NAME.to_string());
    }
}

/// Filesystem mailbox list.
///
/// ```text
/// {root}/
///   subscriptions
///   dbox-uidvalidity
///   mailboxes/
///     {name}/
///       mailbox.index
///       mailbox.index.log
///       dbox-Mails/
///         u.{uid}
/// ```
/// With a separate index or control root, the same `mailboxes/{name}`
/// structure is mirrored there.
#[derive(Debug, Clone)]
pub struct FsMailboxList {
    root_dir: PathBuf,
    index_dir: PathBuf,
    control_dir: PathBuf,
    subscription_fname: String,
    maildir_name: String,
    mailbox_dir_name: String,
    props: ListProps,
}

impl FsMailboxList {
    pub fn new(mut settings: ListSettings) -> Self {
        settings.apply_dbox_defaults();
        let root_dir = settings.root_dir;
        Self {
            index_dir: settings.index_dir.unwrap_or_else(|| root_dir.clone()),
            control_dir: settings.control_dir.unwrap_or_else(|| root_dir.clone()),
            root_dir,
            subscription_fname: settings.subscription_fname.unwrap_or_default(),
            maildir_name: settings.maildir_name.unwrap_or_default(),
            mailbox_dir_name: settings.mailbox_dir_name.unwrap_or_default(),
            props: ListProps {
                no_noselect: settings.no_noselect,
            },
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn subscriptions_path(&self) -> PathBuf {
        self.control_dir.join(&self.subscription_fname)
    }

    pub fn maildir_name(&self) -> &str {
        &self.maildir_name
    }

    /// Directory holding the whole mailbox tree.
    pub fn mailboxes_dir(&self) -> PathBuf {
        self.root_dir.join(&self.mailbox_dir_name)
    }

    /// A fresh temporary file name, unique across processes.
    pub fn temp_file_name(&self) -> String {
        format!(
            "{}{}.{}",
            GLOBAL_TEMP_PREFIX,
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        )
    }

    /// Every directory that holds state of `name`, without duplicates.
    pub fn mailbox_dirs(&self, name: &str) -> Vec<PathBuf> {
        let mut dirs = vec![self.get_path(Some(name), PathType::Dir)];
        for path_type in [PathType::Index, PathType::Control] {
            let path = self.get_path(Some(name), path_type);
            if !dirs.contains(&path) {
                dirs.push(path);
            }
        }
        dirs
    }

    /// Names of all mailbox directories, parents before children.
    pub fn walk(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let root = self.mailboxes_dir();
        match fs::metadata(&root) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e),
        }
        self.walk_dir(&root, None, &mut names)?;
        Ok(names)
    }

    fn walk_dir(
        &self,
        dir: &Path,
        prefix: Option<&str>,
        names: &mut Vec<String>,
    ) -> io::Result<()> {
        let mut children = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                debug!("Skipping non-UTF-8 directory in {}", dir.display());
                continue;
            };
            if file_name == self.maildir_name || file_name.starts_with('.') {
                continue;
            }
            children.push(file_name);
        }
        children.sort();

        for child in children {
            let name = match prefix {
                Some(prefix) => format!("{}{}{}", prefix, HIERARCHY_SEP, child),
                None => child.clone(),
            };
            names.push(name.clone());
            self.walk_dir(&dir.join(&child), Some(&name), names)?;
        }
        Ok(())
    }

    /// Whether mailbox `name` has child mailboxes.
    pub fn has_children(&self, name: &str) -> io::Result<bool> {
        let dir = self.get_path(Some(name), PathType::Dir);
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            if entry.file_type()?.is_dir()
                && file_name != self.maildir_name.as_str()
                && !file_name.to_string_lossy().starts_with('.')
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn join_name(base: &Path, name: &str) -> PathBuf {
        name.split(HIERARCHY_SEP)
            .fold(base.to_path_buf(), |path, part| path.join(part))
    }
}

impl MailboxList for FsMailboxList {
    fn hierarchy_sep(&self) -> char {
        HIERARCHY_SEP
    }

    fn props(&self) -> ListProps {
        self.props
    }

    fn get_path(&self, name: Option<&str>, path_type: PathType) -> PathBuf {
        let base = match path_type {
            PathType::Dir | PathType::Mailbox => &self.root_dir,
            PathType::Index => &self.index_dir,
            PathType::Control => &self.control_dir,
        };
        let Some(name) = name else {
            return base.clone();
        };
        let dir = Self::join_name(&base.join(&self.mailbox_dir_name), name);
        match path_type {
            PathType::Mailbox => dir.join(&self.maildir_name),
            _ => dir,
        }
    }

    fn global_temp_prefix(&self) -> &str {
        GLOBAL_TEMP_PREFIX
    }

    fn is_valid_name(&self, name: &str) -> bool {
        !name.is_empty()
            && !name.contains('\0')
            && name.split(HIERARCHY_SEP).all(|part| {
                !part.is_empty() && !part.starts_with('.') && part != self.maildir_name
            })
    }
}

/// Match `name` against an IMAP list pattern. `*` matches anything, `%`
/// anything but the hierarchy separator.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    matches_from(&pattern, &name)
}

fn matches_from(pattern: &[char], name: &[char]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some(('*', rest)) => (0..=name.len()).any(|i| matches_from(rest, &name[i..])),
        Some(('%', rest)) => {
            let limit = name
                .iter()
                .position(|c| *c == HIERARCHY_SEP)
                .unwrap_or(name.len());
            (0..=limit).any(|i| matches_from(rest, &name[i..]))
        }
        Some((c, rest)) => name
            .split_first()
            .is_some_and(|(n, name_rest)| n == c && matches_from(rest, name_rest)),
    }
}
