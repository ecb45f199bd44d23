//! dbox mailboxes: one file per message under `dbox-Mails/`, metadata in
//! the mailbox's [`FileIndex`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use mail_storage_core::{
    ErrorState, HeaderLookup, IndexHeader, IndexRecord, IndexSync, IndexSyncFlags, IndexView,
    Keywords, Mail, MailFlags, MailIndex, MailSave, MailSearch, Mailbox, MailboxList,
    MailboxStatus, MailboxSync, MailboxTransaction, ModifyType, NotifyCallback, OpenFlags,
    PathType, SaveRequest, SearchArg, SeqRange, SortType, StatusItems, StorageError, SyncBegin,
    SyncFlags, SyncRecord, SyncType, TransactionFlags, MIN_NOTIFY_INTERVAL,
};
use tracing::{debug, info, instrument, warn};

use crate::bootstrap;
use crate::index::{FileIndex, FileStamp};
use crate::reclaim;
use crate::storage::StorageShared;
use crate::uidvalidity::{next_uid_validity, UIDVALIDITY_FILE_NAME};
use crate::watch::LogWatcher;

const SAVE_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenMode {
    /// Open an existing mailbox for use.
    Select,
    /// Open a freshly created directory so its index can be built.
    Create,
}

fn mail_path(mail_dir: &Path, uid: u32) -> PathBuf {
    mail_dir.join(format!("u.{}", uid))
}

/// Acquire the index's sync scope for a mailbox operation.
fn begin_sync<'a>(
    index: &'a FileIndex,
    errors: &ErrorState,
) -> Result<Box<dyn IndexSync + 'a>, StorageError> {
    match index.sync_begin(IndexSyncFlags::default()) {
        Ok(SyncBegin::Started(scope)) | Ok(SyncBegin::NothingToSync(Some(scope))) => Ok(scope),
        Ok(SyncBegin::NothingToSync(None)) => {
            index.reset_error();
            Err(errors.critical("Index sync began without a view"))
        }
        Err(e) => {
            let err = errors.critical(format_args!("Index sync failed: {}", e));
            index.reset_error();
            Err(err)
        }
    }
}

pub struct DboxMailbox {
    shared: Arc<StorageShared>,
    name: String,
    dir: PathBuf,
    mail_dir: PathBuf,
    index: FileIndex,
    view: IndexView,
    readonly: bool,
    keep_recent: bool,
    /// UIDs this session owns as recent.
    recent: BTreeSet<u32>,
    log_stamp: Option<FileStamp>,
    watcher: Option<LogWatcher>,
    inconsistent: bool,
}

impl DboxMailbox {
    #[instrument(skip(shared, flags), level = "debug")]
    pub(crate) fn open(
        shared: Arc<StorageShared>,
        name: &str,
        flags: OpenFlags,
        mode: OpenMode,
    ) -> Result<Self, StorageError> {
        let errors = &shared.errors;
        let dir = shared.list.get_path(Some(name), PathType::Dir);
        // also tells us whether the mailbox exists
        if let Err(e) = reclaim::cleanup_if_exists(
            &dir,
            shared.list.global_temp_prefix(),
            &shared.policy,
            SystemTime::now(),
        ) {
            return Err(errors.io("stat", &dir, &e, || format!("Mailbox doesn't exist: {}", name)));
        }

        let index_dir = shared.list.get_path(Some(name), PathType::Index);
        let index = FileIndex::open(&index_dir, shared.settings.flags.fsync_disable)
            .map_err(|e| errors.critical(e))?;
        let view = index.view().map_err(|e| {
            let err = errors.critical(e);
            index.reset_error();
            err
        })?;

        let readonly = flags.readonly
            || fs::metadata(&dir)
                .map(|meta| meta.permissions().readonly())
                .unwrap_or(false);
        let mail_dir = shared.list.get_path(Some(name), PathType::Mailbox);
        let log_stamp = FileStamp::of(&index_dir.join(crate::index::LOG_FILE_NAME));

        let needs_index = mode == OpenMode::Select && view.header.uid_validity == 0;
        if needs_index && !mail_dir.is_dir() && !index.exists() {
            return Err(errors.not_found(format!("Mailbox isn't selectable: {}", name)));
        }

        let mut mailbox = Self {
            name: name.to_string(),
            dir,
            mail_dir,
            index,
            view,
            readonly,
            keep_recent: flags.keep_recent,
            recent: BTreeSet::new(),
            log_stamp,
            watcher: None,
            inconsistent: false,
            shared,
        };

        if needs_index {
            warn!("Index of {} is missing, recreating it", name);
            mailbox.create_indexes()?;
            mailbox
                .shared
                .notify_no(&format!("Index of mailbox {} was lost and has been rebuilt", name));
        }
        if mode == OpenMode::Select {
            mailbox.refresh_recent()?;
        }

        debug!(
            "Opened {} ({} messages, readonly={})",
            name,
            mailbox.view.records.len(),
            mailbox.readonly
        );
        Ok(mailbox)
    }

    /// Build the index unless a concurrent creator already did. Returns
    /// whether this call initialized it.
    pub(crate) fn create_indexes(&mut self) -> Result<bool, StorageError> {
        let shared = Arc::clone(&self.shared);
        let errors = &shared.errors;
        let counter = shared
            .list
            .get_path(None, PathType::Control)
            .join(UIDVALIDITY_FILE_NAME);

        let fsync = !shared.settings.flags.fsync_disable;
        let mail_dir = &self.mail_dir;
        let initialized = bootstrap::create_indexes(&self.index, errors, |_view, transaction| {
            let uid_validity = next_uid_validity(&counter, fsync).map_err(|e| {
                errors.critical(format_args!("uidvalidity file {}: {}", counter.display(), e))
            })?;
            transaction.update_header(IndexHeader {
                uid_validity,
                next_uid: 1,
                messages_count: 0,
                first_recent_uid: 1,
                keywords: Vec::new(),
            });
            // messages left over from a lost index
            for record in scan_mail_files(mail_dir) {
                transaction.append(record);
            }
            Ok(())
        })?;

        fs::create_dir_all(&self.mail_dir).map_err(|e| {
            errors.critical(format_args!("mkdir({}) failed: {}", self.mail_dir.display(), e))
        })?;
        self.reload_view()?;
        Ok(initialized)
    }

    fn log_path(&self) -> PathBuf {
        self.index
            .log_path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.dir.join(crate::index::LOG_FILE_NAME))
    }

    fn reload_view(&mut self) -> Result<(), StorageError> {
        self.view = self.fresh_view()?;
        self.log_stamp = FileStamp::of(&self.log_path());
        Ok(())
    }

    fn fresh_view(&self) -> Result<IndexView, StorageError> {
        self.index.view().map_err(|e| {
            let err = self.shared.errors.critical(e);
            self.index.reset_error();
            err
        })
    }

    fn wants_recent(&self) -> bool {
        !self.readonly && !self.keep_recent
    }

    /// Claim messages nobody has seen as recent yet. Only one session gets
    /// each of them.
    fn refresh_recent(&mut self) -> Result<(), StorageError> {
        let header = &self.view.header;
        if !self.wants_recent() || header.first_recent_uid >= header.next_uid {
            return Ok(());
        }

        let mut scope = begin_sync(&self.index, &self.shared.errors)?;
        let claimed = claim_recent(scope.as_mut());
        scope.commit().map_err(|e| {
            self.shared
                .errors
                .critical(format_args!("Committing recent marker failed: {}", e))
        })?;
        self.recent.extend(claimed);
        self.reload_view()
    }

    fn is_recent(&self, view: &IndexView, uid: u32) -> bool {
        self.recent.contains(&uid) || (!self.wants_recent() && uid >= view.header.first_recent_uid)
    }

    fn mail_of(&self, seq: u32, record: &IndexRecord) -> Mail {
        let mut flags = record.flags;
        if self.is_recent(&self.view, record.uid) {
            flags.insert(MailFlags::RECENT);
        }
        Mail {
            seq,
            uid: record.uid,
            flags,
            keywords: record.keywords.clone(),
            received_date: record.received_date,
            from_envelope: record.from_envelope.clone(),
            size: record.size,
            data: Vec::new(),
        }
    }

    fn status_of(&self, view: &IndexView, items: StatusItems) -> MailboxStatus {
        let mut status = MailboxStatus::default();
        if items.messages {
            status.messages = view.records.len() as u32;
        }
        if items.recent {
            status.recent = view
                .records
                .iter()
                .filter(|r| self.is_recent(view, r.uid))
                .count() as u32;
        }
        if items.unseen {
            let unseen: Vec<usize> = view
                .records
                .iter()
                .enumerate()
                .filter(|(_, r)| !r.flags.contains(MailFlags::SEEN))
                .map(|(pos, _)| pos)
                .collect();
            status.unseen = unseen.len() as u32;
            status.first_unseen_seq = unseen.first().map_or(0, |pos| *pos as u32 + 1);
        }
        if items.uidvalidity {
            status.uidvalidity = view.header.uid_validity;
        }
        if items.uidnext {
            status.uidnext = view.header.next_uid;
        }
        if items.keywords {
            status.keywords = view.header.keywords.clone();
        }
        status
    }

    fn cleanup_temp_files(&self) {
        if let Err(e) = reclaim::cleanup_if_exists(
            &self.dir,
            self.shared.list.global_temp_prefix(),
            &self.shared.policy,
            SystemTime::now(),
        ) {
            debug!("Temp file cleanup of {} skipped: {}", self.name, e);
        }
    }

    fn remove_mail_files(&self, uids: &[u32]) {
        for uid in uids {
            let path = mail_path(&self.mail_dir, *uid);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

/// Index records for the `u.<uid>` files in `mail_dir`, in UID order.
fn scan_mail_files(mail_dir: &Path) -> Vec<IndexRecord> {
    let Ok(entries) = fs::read_dir(mail_dir) else {
        return Vec::new();
    };
    let mut records: Vec<IndexRecord> = entries
        .flatten()
        .filter_map(|entry| {
            let uid: u32 = entry.file_name().to_str()?.strip_prefix("u.")?.parse().ok()?;
            // the next UID has to stay representable
            if uid == 0 || uid == u32::MAX {
                warn!("Ignoring {} with unusable UID", entry.path().display());
                return None;
            }
            let meta = entry.metadata().ok().filter(|m| m.is_file())?;
            let received_date = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Some(IndexRecord {
                uid,
                flags: MailFlags::empty(),
                keywords: Vec::new(),
                received_date,
                from_envelope: None,
                size: meta.len(),
            })
        })
        .collect();
    records.sort_by_key(|r| r.uid);
    if !records.is_empty() {
        info!("Found {} messages in {}", records.len(), mail_dir.display());
    }
    records
}

/// Mark everything at or above the recent marker as ours and move the
/// marker past it.
fn claim_recent(scope: &mut dyn IndexSync) -> Vec<u32> {
    let mut header = scope.header().clone();
    let claimed: Vec<u32> = scope
        .view()
        .records
        .iter()
        .filter(|r| r.uid >= header.first_recent_uid)
        .map(|r| r.uid)
        .collect();
    if header.first_recent_uid < header.next_uid {
        header.first_recent_uid = header.next_uid;
        scope.transaction().update_header(header);
    }
    claimed
}

/// Changes between two views: expunges first, highest sequence first, then
/// flag and keyword changes in the sequence numbers left after them.
fn diff_views(old: &IndexView, new: &IndexView) -> Vec<SyncRecord> {
    let mut records = Vec::new();
    for (pos, record) in old.records.iter().enumerate().rev() {
        if new.seq_of(record.uid).is_none() {
            let seq = pos as u32 + 1;
            records.push(SyncRecord {
                seq1: seq,
                seq2: seq,
                sync_type: SyncType::Expunge,
            });
        }
    }
    for record in &old.records {
        let Some(seq) = new.seq_of(record.uid) else {
            continue;
        };
        let Some(current) = new.record(seq) else {
            continue;
        };
        if current.flags != record.flags {
            records.push(SyncRecord {
                seq1: seq,
                seq2: seq,
                sync_type: SyncType::Flags,
            });
        }
        if current.keywords != record.keywords {
            records.push(SyncRecord {
                seq1: seq,
                seq2: seq,
                sync_type: SyncType::Keywords,
            });
        }
    }
    records
}

fn is_valid_keyword(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('\\')
        && name
            .chars()
            .all(|c| c.is_ascii_graphic() && !"(){%*\"\\]".contains(c))
}

fn is_valid_header_field(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_graphic() && c != ':')
}

impl Mailbox for DboxMailbox {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn allow_new_keywords(&self) -> bool {
        !self.readonly
    }

    fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        debug!("Closed {}", self.name);
        Ok(())
    }

    fn status(&mut self, items: StatusItems) -> Result<MailboxStatus, StorageError> {
        let view = self.fresh_view()?;
        Ok(self.status_of(&view, items))
    }

    #[instrument(skip(self), level = "debug", fields(mailbox = %self.name))]
    fn sync_init(&mut self, flags: SyncFlags) -> Result<Box<dyn MailboxSync + '_>, StorageError> {
        let log_stamp = FileStamp::of(&self.log_path());
        if !flags.expunge && log_stamp.is_some() && log_stamp == self.log_stamp {
            debug!("Index unchanged since last sync");
            return Ok(Box::new(DboxSync {
                records: VecDeque::new(),
                status: self.status_of(&self.view, StatusItems::all()),
            }));
        }

        let mut latest = self.fresh_view()?;
        let wants_recent =
            self.wants_recent() && latest.header.first_recent_uid < latest.header.next_uid;
        if (flags.expunge && !self.readonly) || wants_recent {
            let errors = &self.shared.errors;
            let mut scope = begin_sync(&self.index, errors)?;
            let claimed = if wants_recent {
                claim_recent(scope.as_mut())
            } else {
                Vec::new()
            };
            let expunged: Vec<u32> = if flags.expunge && !self.readonly {
                scope
                    .view()
                    .records
                    .iter()
                    .filter(|r| r.flags.contains(MailFlags::DELETED))
                    .map(|r| r.uid)
                    .collect()
            } else {
                Vec::new()
            };
            for uid in &expunged {
                scope.transaction().expunge(*uid);
            }
            scope
                .commit()
                .map_err(|e| errors.critical(format_args!("Committing sync failed: {}", e)))?;

            self.recent.extend(claimed);
            self.remove_mail_files(&expunged);
            if !expunged.is_empty() {
                info!("Expunged {} messages from {}", expunged.len(), self.name);
            }
            latest = self.fresh_view()?;
        }

        let old_validity = self.view.header.uid_validity;
        if old_validity != 0 && latest.header.uid_validity != old_validity {
            self.inconsistent = true;
            return Err(self.shared.errors.critical(format_args!(
                "UID validity of {} changed from {} to {}",
                self.name, old_validity, latest.header.uid_validity
            )));
        }

        let records = diff_views(&self.view, &latest);
        self.view = latest;
        let view = &self.view;
        self.recent.retain(|uid| view.seq_of(*uid).is_some());
        self.log_stamp = FileStamp::of(&self.log_path());

        Ok(Box::new(DboxSync {
            records: records.into(),
            status: self.status_of(&self.view, StatusItems::all()),
        }))
    }

    fn notify_changes(
        &mut self,
        min_interval: Duration,
        callback: Option<NotifyCallback>,
    ) -> Result<(), StorageError> {
        let Some(callback) = callback else {
            if self.watcher.take().is_some() {
                debug!("Removed change watch on {}", self.name);
            }
            return Ok(());
        };

        let interval = if min_interval.is_zero() {
            MIN_NOTIFY_INTERVAL
        } else {
            min_interval
        };
        let log_path = self.log_path();
        self.watcher = None;
        let watcher = LogWatcher::start(&self.name, &log_path, interval, callback).map_err(|e| {
            self.shared
                .errors
                .critical(format_args!("Failed to watch {}: {}", log_path.display(), e))
        })?;
        self.watcher = Some(watcher);

        self.cleanup_temp_files();
        Ok(())
    }

    fn get_uids(&self, uid1: u32, uid2: u32) -> Result<Option<SeqRange>, StorageError> {
        let records = &self.view.records;
        let first = records.partition_point(|r| r.uid < uid1);
        let last = records.partition_point(|r| r.uid <= uid2);
        if first >= last {
            return Ok(None);
        }
        Ok(Some(SeqRange::new(first as u32 + 1, last as u32)))
    }

    fn header_lookup_init(&self, fields: &[&str]) -> Result<HeaderLookup, StorageError> {
        if fields.is_empty() {
            return Err(self.shared.errors.syntax("No header fields given"));
        }
        if let Some(bad) = fields.iter().find(|f| !is_valid_header_field(f)) {
            return Err(self
                .shared
                .errors
                .syntax(format!("Invalid header field name: {}", bad)));
        }
        Ok(HeaderLookup::new(&self.name, fields))
    }

    fn search_get_sorting(&self) -> Vec<SortType> {
        vec![SortType::Arrival]
    }

    fn transaction_begin(
        &mut self,
        flags: TransactionFlags,
    ) -> Result<Box<dyn MailboxTransaction + '_>, StorageError> {
        Ok(Box::new(DboxTransaction {
            mailbox: self,
            flags,
            staged: Vec::new(),
            updates: Vec::new(),
        }))
    }
}

impl Drop for DboxMailbox {
    fn drop(&mut self) {
        if self.watcher.take().is_some() {
            debug!("Dropped change watch on {}", self.name);
        }
    }
}

// =============================================================================
// Sync context
// =============================================================================

struct DboxSync {
    records: VecDeque<SyncRecord>,
    status: MailboxStatus,
}

impl MailboxSync for DboxSync {
    fn next(&mut self) -> Result<Option<SyncRecord>, StorageError> {
        Ok(self.records.pop_front())
    }

    fn deinit(self: Box<Self>) -> Result<MailboxStatus, StorageError> {
        Ok(self.status)
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// A message written to a temp file, waiting for commit to get a UID.
struct StagedMail {
    temp_path: PathBuf,
    flags: MailFlags,
    keywords: Vec<String>,
    received_date: DateTime<Utc>,
    from_envelope: Option<String>,
    size: u64,
}

struct FlagUpdate {
    uid: u32,
    modify: ModifyType,
    flags: MailFlags,
    keywords: Option<Vec<String>>,
}

impl FlagUpdate {
    fn apply(&self, flags: MailFlags, keywords: Vec<String>) -> (MailFlags, Vec<String>) {
        match self.modify {
            ModifyType::Add => {
                let mut keywords = keywords;
                for name in self.keywords.iter().flatten() {
                    if !keywords.contains(name) {
                        keywords.push(name.clone());
                    }
                }
                (flags.union(self.flags), keywords)
            }
            ModifyType::Remove => {
                let removed = self.keywords.as_deref().unwrap_or_default();
                let keywords = keywords.into_iter().filter(|k| !removed.contains(k)).collect();
                (flags.difference(self.flags), keywords)
            }
            ModifyType::Replace => (self.flags, self.keywords.clone().unwrap_or_default()),
        }
    }
}

fn remove_temp_files(staged: &[StagedMail]) {
    for mail in staged {
        if let Err(e) = fs::remove_file(&mail.temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", mail.temp_path.display(), e);
            }
        }
    }
}

pub struct DboxTransaction<'a> {
    mailbox: &'a DboxMailbox,
    flags: TransactionFlags,
    staged: Vec<StagedMail>,
    updates: Vec<FlagUpdate>,
}

impl DboxTransaction<'_> {
    fn errors(&self) -> &ErrorState {
        &self.mailbox.shared.errors
    }

    fn temp_path(&self) -> PathBuf {
        self.mailbox.dir.join(self.mailbox.shared.list.temp_file_name())
    }

    fn create_temp(&self) -> Result<(PathBuf, File), StorageError> {
        let path = self.temp_path();
        let name = &self.mailbox.name;
        let file = File::create(&path).map_err(|e| {
            self.errors()
                .io("open", &path, &e, || format!("Mailbox doesn't exist: {}", name))
        })?;
        Ok((path, file))
    }

    fn write_staged(&mut self, scope: &mut dyn IndexSync) -> Result<Vec<u32>, StorageError> {
        let mailbox = self.mailbox;
        let errors = &mailbox.shared.errors;

        let first_uid = scope.header().next_uid.max(1);
        let end_uid = u32::try_from(self.staged.len())
            .ok()
            .and_then(|count| first_uid.checked_add(count))
            .ok_or_else(|| {
                errors.critical(format_args!(
                    "No UIDs left in {} for {} messages",
                    mailbox.name,
                    self.staged.len()
                ))
            })?;

        if self.flags.external && !self.staged.is_empty() {
            // saved mails shouldn't become recent, unless earlier ones are
            // still waiting to be claimed
            let mut header = scope.header().clone();
            if header.first_recent_uid >= header.next_uid {
                header.first_recent_uid = end_uid;
                scope.transaction().update_header(header);
            }
        }

        let mut current: HashMap<u32, (MailFlags, Vec<String>)> = HashMap::new();
        for update in &self.updates {
            let view = scope.view();
            let Some(record) = view.seq_of(update.uid).and_then(|seq| view.record(seq)) else {
                debug!("Skipping flag update of expunged uid {}", update.uid);
                continue;
            };
            let (flags, keywords) = current
                .remove(&update.uid)
                .unwrap_or_else(|| (record.flags, record.keywords.clone()));
            current.insert(update.uid, update.apply(flags, keywords));
        }
        let mut changed: Vec<_> = current.into_iter().collect();
        changed.sort_by_key(|(uid, _)| *uid);
        for (uid, (flags, keywords)) in changed {
            scope.transaction().update_flags(uid, flags, keywords);
        }

        if self.staged.is_empty() {
            return Ok(Vec::new());
        }
        fs::create_dir_all(&mailbox.mail_dir).map_err(|e| {
            errors.critical(format_args!("mkdir({}) failed: {}", mailbox.mail_dir.display(), e))
        })?;

        let staged = std::mem::take(&mut self.staged);
        let mut next_uid = first_uid;
        let mut uids = Vec::with_capacity(staged.len());
        for (pos, mail) in staged.iter().enumerate() {
            let uid = next_uid;
            let dest = mail_path(&mailbox.mail_dir, uid);
            if let Err(e) = fs::rename(&mail.temp_path, &dest) {
                mailbox.remove_mail_files(&uids);
                remove_temp_files(&staged[pos..]);
                return Err(errors.critical(format_args!(
                    "rename({}, {}) failed: {}",
                    mail.temp_path.display(),
                    dest.display(),
                    e
                )));
            }
            scope.transaction().append(IndexRecord {
                uid,
                flags: mail.flags,
                keywords: mail.keywords.clone(),
                received_date: mail.received_date,
                from_envelope: mail.from_envelope.clone(),
                size: mail.size,
            });
            uids.push(uid);
            next_uid += 1;
        }
        Ok(uids)
    }
}

impl MailboxTransaction for DboxTransaction<'_> {
    fn keywords_create(&mut self, names: &[&str]) -> Result<Keywords, StorageError> {
        if let Some(bad) = names.iter().find(|n| !is_valid_keyword(n)) {
            return Err(self.errors().syntax(format!("Invalid keyword: {}", bad)));
        }
        Ok(Keywords::new(names.iter().map(|n| n.to_string()).collect()))
    }

    fn update_flags(
        &mut self,
        uid: u32,
        modify: ModifyType,
        flags: MailFlags,
        keywords: Option<&Keywords>,
    ) -> Result<(), StorageError> {
        if self.mailbox.view.seq_of(uid).is_none() {
            debug!("Ignoring flag update of unknown uid {}", uid);
            return Ok(());
        }
        self.updates.push(FlagUpdate {
            uid,
            modify,
            // recent is per session, never stored
            flags: flags.difference(MailFlags::RECENT),
            keywords: keywords.map(|k| k.names().to_vec()),
        });
        Ok(())
    }

    fn search_init(
        &mut self,
        charset: Option<&str>,
        args: &[SearchArg],
        sort: &[SortType],
    ) -> Result<Box<dyn MailSearch + '_>, StorageError> {
        if let Some(charset) = charset {
            if !charset.eq_ignore_ascii_case("UTF-8") && !charset.eq_ignore_ascii_case("US-ASCII") {
                return Err(self
                    .errors()
                    .syntax(format!("Unknown charset: {}", charset)));
            }
        }
        if let Some(unsupported) = sort.iter().find(|s| **s != SortType::Arrival) {
            return Err(self
                .errors()
                .syntax(format!("Unsupported sort program: {:?}", unsupported)));
        }

        let mailbox = self.mailbox;
        let matches: VecDeque<Mail> = mailbox
            .view
            .records
            .iter()
            .enumerate()
            .map(|(pos, record)| mailbox.mail_of(pos as u32 + 1, record))
            .filter(|mail| args.iter().all(|arg| arg.matches(mail)))
            .collect();
        debug!("Search in {} matched {} messages", mailbox.name, matches.len());

        Ok(Box::new(DboxSearch {
            shared: Arc::clone(&mailbox.shared),
            mail_dir: mailbox.mail_dir.clone(),
            matches,
        }))
    }

    fn save_init<'t>(
        &'t mut self,
        request: SaveRequest<'t>,
    ) -> Result<Box<dyn MailSave + 't>, StorageError> {
        let (temp_path, file) = self.create_temp()?;
        Ok(Box::new(DboxSave {
            shared: Arc::clone(&self.mailbox.shared),
            staged: &mut self.staged,
            input: request.input,
            file: Some(file),
            temp_path,
            flags: request.flags.difference(MailFlags::RECENT),
            keywords: request.keywords.map(|k| k.names().to_vec()).unwrap_or_default(),
            received_date: request.received_date.unwrap_or_else(Utc::now),
            from_envelope: request.from_envelope,
            size: 0,
            buf: vec![0; SAVE_BUFFER_SIZE],
        }))
    }

    fn copy(&mut self, mail: &Mail) -> Result<(), StorageError> {
        let (temp_path, mut file) = self.create_temp()?;
        if let Err(e) = file.write_all(&mail.data) {
            let _ = fs::remove_file(&temp_path);
            return Err(self
                .errors()
                .critical(format_args!("write({}) failed: {}", temp_path.display(), e)));
        }
        self.staged.push(StagedMail {
            temp_path,
            flags: mail.flags.difference(MailFlags::RECENT),
            keywords: mail.keywords.clone(),
            received_date: mail.received_date,
            from_envelope: mail.from_envelope.clone(),
            size: mail.data.len() as u64,
        });
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<Vec<u32>, StorageError> {
        if self.staged.is_empty() && self.updates.is_empty() {
            return Ok(Vec::new());
        }

        let mailbox = self.mailbox;
        let errors = &mailbox.shared.errors;
        let mut scope = begin_sync(&mailbox.index, errors)?;
        let uids = match self.write_staged(scope.as_mut()) {
            Ok(uids) => uids,
            Err(e) => {
                scope.rollback();
                return Err(e);
            }
        };
        if let Err(e) = scope.commit() {
            mailbox.remove_mail_files(&uids);
            return Err(errors.critical(format_args!("Committing transaction failed: {}", e)));
        }

        debug!(
            "Committed {} saves and {} flag updates to {}",
            uids.len(),
            self.updates.len(),
            mailbox.name
        );
        self.updates.clear();
        Ok(uids)
    }

    fn rollback(self: Box<Self>) {
        debug!(
            "Rolled back {} saves and {} flag updates in {}",
            self.staged.len(),
            self.updates.len(),
            self.mailbox.name
        );
    }
}

impl Drop for DboxTransaction<'_> {
    fn drop(&mut self) {
        remove_temp_files(&self.staged);
    }
}

// =============================================================================
// Search and save contexts
// =============================================================================

struct DboxSearch {
    shared: Arc<StorageShared>,
    mail_dir: PathBuf,
    matches: VecDeque<Mail>,
}

impl MailSearch for DboxSearch {
    fn next(&mut self) -> Result<Option<Mail>, StorageError> {
        while let Some(mut mail) = self.matches.pop_front() {
            let path = mail_path(&self.mail_dir, mail.uid);
            match fs::read(&path) {
                Ok(data) => {
                    mail.data = data;
                    return Ok(Some(mail));
                }
                // expunged by another session since our view
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Skipping vanished message {}", path.display());
                }
                Err(e) => {
                    return Err(self
                        .shared
                        .errors
                        .critical(format_args!("read({}) failed: {}", path.display(), e)))
                }
            }
        }
        Ok(None)
    }

    fn deinit(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

struct DboxSave<'t> {
    shared: Arc<StorageShared>,
    staged: &'t mut Vec<StagedMail>,
    input: Box<dyn Read + 't>,
    file: Option<File>,
    temp_path: PathBuf,
    flags: MailFlags,
    keywords: Vec<String>,
    received_date: DateTime<Utc>,
    from_envelope: Option<String>,
    size: u64,
    buf: Vec<u8>,
}

impl MailSave for DboxSave<'_> {
    fn save_continue(&mut self) -> Result<bool, StorageError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };
        let n = loop {
            match self.input.read(&mut self.buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self
                        .shared
                        .errors
                        .critical(format_args!("read(mail input) failed: {}", e)))
                }
            }
        };
        if n == 0 {
            return Ok(false);
        }
        file.write_all(&self.buf[..n]).map_err(|e| {
            self.shared
                .errors
                .critical(format_args!("write({}) failed: {}", self.temp_path.display(), e))
        })?;
        self.size += n as u64;
        Ok(true)
    }

    fn finish(mut self: Box<Self>) -> Result<(), StorageError> {
        while self.save_continue()? {}
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        if !self.shared.settings.flags.fsync_disable {
            file.sync_data().map_err(|e| {
                self.shared
                    .errors
                    .critical(format_args!("fsync({}) failed: {}", self.temp_path.display(), e))
            })?;
        }
        drop(file);

        let staged = StagedMail {
            temp_path: std::mem::take(&mut self.temp_path),
            flags: self.flags,
            keywords: std::mem::take(&mut self.keywords),
            received_date: self.received_date,
            from_envelope: self.from_envelope.take(),
            size: self.size,
        };
        self.staged.push(staged);
        Ok(())
    }

    fn cancel(self: Box<Self>) {
        debug!("Cancelled save into {}", self.temp_path.display());
    }
}

impl Drop for DboxSave<'_> {
    fn drop(&mut self) {
        // unfinished: the temp file belongs to nobody
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}
