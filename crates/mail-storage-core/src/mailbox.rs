//! The operation contract every backend's mailboxes implement, and the
//! guarded handles callers use to reach them.
//!
//! Backends implement [`Mailbox`] and the context traits. Callers go through
//! [`MailboxHandle`] and [`Transaction`], which refuse to dispatch on a
//! closed handle and short-circuit mutations on a read-only one before the
//! backend sees them.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage::MailStorage;
use crate::types::{
    HeaderLookup, Keywords, Mail, MailFlags, MailboxStatus, ModifyType, NotifyCallback,
    SaveRequest, SearchArg, SeqRange, SortType, StatusItems, SyncFlags, SyncRecord,
    TransactionFlags,
};

// =============================================================================
// Backend contract
// =============================================================================

pub trait Mailbox {
    fn name(&self) -> &str;

    fn is_readonly(&self) -> bool;

    fn allow_new_keywords(&self) -> bool;

    /// The view no longer matches what is on disk (e.g., the index was
    /// recreated). The handle must be closed and the mailbox reopened.
    fn is_inconsistent(&self) -> bool;

    /// Release the index and any watches.
    fn close(self: Box<Self>) -> Result<(), StorageError>;

    fn status(&mut self, items: StatusItems) -> Result<MailboxStatus, StorageError>;

    fn sync_init(&mut self, flags: SyncFlags) -> Result<Box<dyn MailboxSync + '_>, StorageError>;

    /// Call `callback` when the mailbox changes, at most once per
    /// `min_interval`. `None` removes every watch; changes are then only
    /// noticed when the next sync checks for staleness.
    fn notify_changes(
        &mut self,
        min_interval: Duration,
        callback: Option<NotifyCallback>,
    ) -> Result<(), StorageError>;

    /// Sequence range covering UIDs `uid1..=uid2`, `None` if no message is
    /// in that range.
    fn get_uids(&self, uid1: u32, uid2: u32) -> Result<Option<SeqRange>, StorageError>;

    fn header_lookup_init(&self, fields: &[&str]) -> Result<HeaderLookup, StorageError>;

    fn header_lookup_deinit(&self, lookup: HeaderLookup) {
        drop(lookup);
    }

    /// Sort programs search can produce without sorting afterwards.
    fn search_get_sorting(&self) -> Vec<SortType>;

    fn transaction_begin(
        &mut self,
        flags: TransactionFlags,
    ) -> Result<Box<dyn MailboxTransaction + '_>, StorageError>;
}

/// Three-phase sync: `sync_init`, then `next` until `None`, then `deinit`.
pub trait MailboxSync {
    fn next(&mut self) -> Result<Option<SyncRecord>, StorageError>;

    fn deinit(self: Box<Self>) -> Result<MailboxStatus, StorageError>;
}

/// Mutation scope bound to one mailbox. Ends with exactly one of
/// `commit` or `rollback`.
pub trait MailboxTransaction {
    fn keywords_create(&mut self, names: &[&str]) -> Result<Keywords, StorageError>;

    fn keywords_free(&mut self, keywords: Keywords) {
        drop(keywords);
    }

    fn update_flags(
        &mut self,
        uid: u32,
        modify: ModifyType,
        flags: MailFlags,
        keywords: Option<&Keywords>,
    ) -> Result<(), StorageError>;

    fn search_init(
        &mut self,
        charset: Option<&str>,
        args: &[SearchArg],
        sort: &[SortType],
    ) -> Result<Box<dyn MailSearch + '_>, StorageError>;

    fn save_init<'t>(
        &'t mut self,
        request: SaveRequest<'t>,
    ) -> Result<Box<dyn MailSave + 't>, StorageError>;

    fn copy(&mut self, mail: &Mail) -> Result<(), StorageError>;

    /// Make the changes visible. Returns the UIDs given to saved and copied
    /// mails, in save order.
    fn commit(self: Box<Self>) -> Result<Vec<u32>, StorageError>;

    fn rollback(self: Box<Self>);
}

pub trait MailSearch {
    fn next(&mut self) -> Result<Option<Mail>, StorageError>;

    fn deinit(self: Box<Self>) -> Result<(), StorageError>;
}

pub trait MailSave {
    /// Consume more of the input. `Ok(true)` while input remains.
    fn save_continue(&mut self) -> Result<bool, StorageError>;

    /// Stage the mail for the transaction's commit.
    fn finish(self: Box<Self>) -> Result<(), StorageError>;

    fn cancel(self: Box<Self>);
}

// =============================================================================
// Guarded dispatch
// =============================================================================

/// An opened mailbox. Borrows its storage, so it cannot outlive it.
pub struct MailboxHandle<'s> {
    storage: &'s dyn MailStorage,
    name: String,
    inner: Option<Box<dyn Mailbox + 's>>,
}

impl<'s> MailboxHandle<'s> {
    pub fn new(storage: &'s dyn MailStorage, mailbox: Box<dyn Mailbox + 's>) -> Self {
        Self {
            storage,
            name: mailbox.name().to_string(),
            inner: Some(mailbox),
        }
    }

    pub fn storage(&self) -> &'s dyn MailStorage {
        self.storage
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn opened(&self) -> Result<&(dyn Mailbox + 's), StorageError> {
        match self.inner.as_deref() {
            Some(mailbox) => Ok(mailbox),
            None => Err(self.closed_error()),
        }
    }

    fn opened_mut(&mut self) -> Result<&mut (dyn Mailbox + 's), StorageError> {
        let (storage, name) = (self.storage, &self.name);
        self.inner
            .as_deref_mut()
            .ok_or_else(|| closed_error(storage, name))
    }

    fn writable_mut(&mut self) -> Result<&mut (dyn Mailbox + 's), StorageError> {
        let readonly = self.opened()?.is_readonly();
        if readonly {
            return Err(read_only_error(self.storage, &self.name));
        }
        self.opened_mut()
    }

    fn closed_error(&self) -> StorageError {
        closed_error(self.storage, &self.name)
    }

    pub fn close(&mut self) -> Result<(), StorageError> {
        match self.inner.take() {
            Some(mailbox) => {
                debug!("Closing mailbox {}", self.name);
                mailbox.close()
            }
            None => Err(self.closed_error()),
        }
    }

    pub fn is_readonly(&self) -> Result<bool, StorageError> {
        Ok(self.opened()?.is_readonly())
    }

    pub fn allow_new_keywords(&self) -> Result<bool, StorageError> {
        Ok(self.opened()?.allow_new_keywords())
    }

    /// A closed handle has no view left to trust, so it reports true.
    pub fn is_inconsistent(&self) -> bool {
        self.inner.as_deref().is_none_or(|m| m.is_inconsistent())
    }

    pub fn status(&mut self, items: StatusItems) -> Result<MailboxStatus, StorageError> {
        self.opened_mut()?.status(items)
    }

    pub fn sync_init(
        &mut self,
        flags: SyncFlags,
    ) -> Result<Box<dyn MailboxSync + '_>, StorageError> {
        let mailbox = if flags.expunge {
            self.writable_mut()?
        } else {
            self.opened_mut()?
        };
        mailbox.sync_init(flags)
    }

    /// Run a whole sync and collect its records.
    pub fn sync(
        &mut self,
        flags: SyncFlags,
    ) -> Result<(Vec<SyncRecord>, MailboxStatus), StorageError> {
        let mut ctx = self.sync_init(flags)?;
        let mut records = Vec::new();
        loop {
            match ctx.next() {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(e) => {
                    // deinit still has to release the scope
                    let _ = ctx.deinit();
                    return Err(e);
                }
            }
        }
        let status = ctx.deinit()?;
        Ok((records, status))
    }

    pub fn notify_changes(
        &mut self,
        min_interval: Duration,
        callback: Option<NotifyCallback>,
    ) -> Result<(), StorageError> {
        self.opened_mut()?.notify_changes(min_interval, callback)
    }

    pub fn get_uids(&self, uid1: u32, uid2: u32) -> Result<Option<SeqRange>, StorageError> {
        self.opened()?.get_uids(uid1, uid2)
    }

    pub fn header_lookup_init(&self, fields: &[&str]) -> Result<HeaderLookup, StorageError> {
        self.opened()?.header_lookup_init(fields)
    }

    pub fn header_lookup_deinit(&self, lookup: HeaderLookup) -> Result<(), StorageError> {
        self.opened()?.header_lookup_deinit(lookup);
        Ok(())
    }

    pub fn search_get_sorting(&self) -> Result<Vec<SortType>, StorageError> {
        Ok(self.opened()?.search_get_sorting())
    }

    pub fn transaction_begin(
        &mut self,
        flags: TransactionFlags,
    ) -> Result<Transaction<'_>, StorageError> {
        let storage = self.storage;
        let name = self.name.clone();
        let mailbox = self.opened_mut()?;
        let readonly = mailbox.is_readonly();
        let inner = mailbox.transaction_begin(flags)?;
        Ok(Transaction {
            storage,
            mailbox: name,
            readonly,
            inner: Some(inner),
        })
    }
}

impl Drop for MailboxHandle<'_> {
    fn drop(&mut self) {
        if let Some(mailbox) = self.inner.take() {
            if let Err(e) = mailbox.close() {
                warn!("Failed to close mailbox {} on drop: {}", self.name, e);
            }
        }
    }
}

fn closed_error(storage: &dyn MailStorage, name: &str) -> StorageError {
    storage
        .errors()
        .closed(format!("Mailbox isn't open: {}", name))
}

fn read_only_error(storage: &dyn MailStorage, name: &str) -> StorageError {
    storage
        .errors()
        .read_only(format!("Mailbox is read-only: {}", name))
}

/// Guarded transaction. Dropping it without `commit` or `rollback` rolls
/// it back.
pub struct Transaction<'h> {
    storage: &'h dyn MailStorage,
    mailbox: String,
    readonly: bool,
    inner: Option<Box<dyn MailboxTransaction + 'h>>,
}

impl<'h> Transaction<'h> {
    pub fn mailbox_name(&self) -> &str {
        &self.mailbox
    }

    fn active(&mut self) -> Result<&mut (dyn MailboxTransaction + 'h), StorageError> {
        match self.inner.as_deref_mut() {
            Some(t) => Ok(t),
            None => Err(self
                .storage
                .errors()
                .closed(format!("Transaction already finished: {}", self.mailbox))),
        }
    }

    fn writable(&mut self) -> Result<&mut (dyn MailboxTransaction + 'h), StorageError> {
        if self.readonly {
            return Err(read_only_error(self.storage, &self.mailbox));
        }
        self.active()
    }

    pub fn keywords_create(&mut self, names: &[&str]) -> Result<Keywords, StorageError> {
        self.writable()?.keywords_create(names)
    }

    pub fn keywords_free(&mut self, keywords: Keywords) -> Result<(), StorageError> {
        self.active()?.keywords_free(keywords);
        Ok(())
    }

    pub fn update_flags(
        &mut self,
        uid: u32,
        modify: ModifyType,
        flags: MailFlags,
        keywords: Option<&Keywords>,
    ) -> Result<(), StorageError> {
        self.writable()?.update_flags(uid, modify, flags, keywords)
    }

    pub fn search_init(
        &mut self,
        charset: Option<&str>,
        args: &[SearchArg],
        sort: &[SortType],
    ) -> Result<Box<dyn MailSearch + '_>, StorageError> {
        self.active()?.search_init(charset, args, sort)
    }

    /// Run a whole search and collect the mails.
    pub fn search(
        &mut self,
        charset: Option<&str>,
        args: &[SearchArg],
        sort: &[SortType],
    ) -> Result<Vec<Mail>, StorageError> {
        let mut ctx = self.search_init(charset, args, sort)?;
        let mut mails = Vec::new();
        while let Some(mail) = ctx.next()? {
            mails.push(mail);
        }
        ctx.deinit()?;
        Ok(mails)
    }

    pub fn save_init<'t>(
        &'t mut self,
        request: SaveRequest<'t>,
    ) -> Result<Box<dyn MailSave + 't>, StorageError> {
        self.writable()?.save_init(request)
    }

    /// Save a whole mail: init, continue until the input is drained, finish.
    pub fn save(&mut self, request: SaveRequest<'_>) -> Result<(), StorageError> {
        let mut ctx = self.save_init(request)?;
        loop {
            match ctx.save_continue() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    ctx.cancel();
                    return Err(e);
                }
            }
        }
        ctx.finish()
    }

    pub fn copy(&mut self, mail: &Mail) -> Result<(), StorageError> {
        self.writable()?.copy(mail)
    }

    pub fn commit(mut self) -> Result<Vec<u32>, StorageError> {
        match self.inner.take() {
            Some(t) => t.commit(),
            None => Err(self
                .storage
                .errors()
                .closed(format!("Transaction already finished: {}", self.mailbox))),
        }
    }

    pub fn rollback(mut self) {
        if let Some(t) = self.inner.take() {
            t.rollback();
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(t) = self.inner.take() {
            warn!(
                "Transaction on {} dropped without commit or rollback, rolling back",
                self.mailbox
            );
            t.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    use crate::error_state::ErrorState;
    use crate::types::{
        ListFlags, MailboxInfo, MailboxNameStatus, OpenFlags, StorageCallbacks,
    };

    /// Records which backend entry points were reached.
    type Calls = Arc<Mutex<Vec<&'static str>>>;

    struct FakeStorage {
        errors: ErrorState,
        readonly: bool,
        calls: Calls,
    }

    impl MailStorage for FakeStorage {
        fn backend_name(&self) -> &'static str {
            "fake"
        }
        fn errors(&self) -> &ErrorState {
            &self.errors
        }
        fn hierarchy_sep(&self) -> char {
            '/'
        }
        fn set_callbacks(&self, _callbacks: Arc<dyn StorageCallbacks>) {}
        fn mailbox_create(&self, _name: &str, _directory: bool) -> Result<(), StorageError> {
            Ok(())
        }
        fn mailbox_delete(&self, _name: &str) -> Result<(), StorageError> {
            Ok(())
        }
        fn mailbox_rename(&self, _old: &str, _new: &str) -> Result<(), StorageError> {
            Ok(())
        }
        fn mailbox_list(
            &self,
            _reference: &str,
            _mask: &str,
            _flags: ListFlags,
        ) -> Result<Vec<MailboxInfo>, StorageError> {
            Ok(vec![])
        }
        fn set_subscribed(&self, _name: &str, _subscribed: bool) -> Result<(), StorageError> {
            Ok(())
        }
        fn is_subscribed(&self, _name: &str) -> Result<bool, StorageError> {
            Ok(false)
        }
        fn mailbox_name_status(&self, _name: &str) -> Result<MailboxNameStatus, StorageError> {
            Ok(MailboxNameStatus::Exists)
        }
        fn mailbox_open(
            &self,
            name: &str,
            _input: Option<Box<dyn Read + Send>>,
            _flags: OpenFlags,
        ) -> Result<Box<dyn Mailbox + '_>, StorageError> {
            Ok(Box::new(FakeMailbox {
                name: name.to_string(),
                readonly: self.readonly,
                calls: self.calls.clone(),
            }))
        }
    }

    struct FakeMailbox {
        name: String,
        readonly: bool,
        calls: Calls,
    }

    impl Mailbox for FakeMailbox {
        fn name(&self) -> &str {
            &self.name
        }
        fn is_readonly(&self) -> bool {
            self.readonly
        }
        fn allow_new_keywords(&self) -> bool {
            true
        }
        fn is_inconsistent(&self) -> bool {
            false
        }
        fn close(self: Box<Self>) -> Result<(), StorageError> {
            self.calls.lock().unwrap().push("close");
            Ok(())
        }
        fn status(&mut self, _items: StatusItems) -> Result<MailboxStatus, StorageError> {
            self.calls.lock().unwrap().push("status");
            Ok(MailboxStatus::default())
        }
        fn sync_init(
            &mut self,
            _flags: SyncFlags,
        ) -> Result<Box<dyn MailboxSync + '_>, StorageError> {
            self.calls.lock().unwrap().push("sync_init");
            Ok(Box::new(FakeSync { left: 2 }))
        }
        fn notify_changes(
            &mut self,
            _min_interval: Duration,
            _callback: Option<NotifyCallback>,
        ) -> Result<(), StorageError> {
            Ok(())
        }
        fn get_uids(&self, _uid1: u32, _uid2: u32) -> Result<Option<SeqRange>, StorageError> {
            Ok(None)
        }
        fn header_lookup_init(&self, fields: &[&str]) -> Result<HeaderLookup, StorageError> {
            Ok(HeaderLookup::new(&self.name, fields))
        }
        fn search_get_sorting(&self) -> Vec<SortType> {
            vec![]
        }
        fn transaction_begin(
            &mut self,
            _flags: TransactionFlags,
        ) -> Result<Box<dyn MailboxTransaction + '_>, StorageError> {
            self.calls.lock().unwrap().push("transaction_begin");
            Ok(Box::new(FakeTransaction {
                calls: self.calls.clone(),
            }))
        }
    }

    struct FakeSync {
        left: u32,
    }

    impl MailboxSync for FakeSync {
        fn next(&mut self) -> Result<Option<SyncRecord>, StorageError> {
            if self.left == 0 {
                return Ok(None);
            }
            self.left -= 1;
            Ok(Some(SyncRecord {
                seq1: 1,
                seq2: 1,
                sync_type: crate::types::SyncType::Flags,
            }))
        }
        fn deinit(self: Box<Self>) -> Result<MailboxStatus, StorageError> {
            Ok(MailboxStatus {
                messages: 3,
                ..Default::default()
            })
        }
    }

    struct FakeTransaction {
        calls: Calls,
    }

    impl MailboxTransaction for FakeTransaction {
        fn keywords_create(&mut self, names: &[&str]) -> Result<Keywords, StorageError> {
            self.calls.lock().unwrap().push("keywords_create");
            Ok(Keywords::new(names.iter().map(|s| s.to_string()).collect()))
        }
        fn update_flags(
            &mut self,
            _uid: u32,
            _modify: ModifyType,
            _flags: MailFlags,
            _keywords: Option<&Keywords>,
        ) -> Result<(), StorageError> {
            self.calls.lock().unwrap().push("update_flags");
            Ok(())
        }
        fn search_init(
            &mut self,
            _charset: Option<&str>,
            _args: &[SearchArg],
            _sort: &[SortType],
        ) -> Result<Box<dyn MailSearch + '_>, StorageError> {
            self.calls.lock().unwrap().push("search_init");
            Ok(Box::new(EmptySearch))
        }
        fn save_init<'t>(
            &'t mut self,
            _request: SaveRequest<'t>,
        ) -> Result<Box<dyn MailSave + 't>, StorageError> {
            self.calls.lock().unwrap().push("save_init");
            Err(StorageError::Internal("not supported".into()))
        }
        fn copy(&mut self, _mail: &Mail) -> Result<(), StorageError> {
            self.calls.lock().unwrap().push("copy");
            Ok(())
        }
        fn commit(self: Box<Self>) -> Result<Vec<u32>, StorageError> {
            self.calls.lock().unwrap().push("commit");
            Ok(vec![])
        }
        fn rollback(self: Box<Self>) {
            self.calls.lock().unwrap().push("rollback");
        }
    }

    struct EmptySearch;

    impl MailSearch for EmptySearch {
        fn next(&mut self) -> Result<Option<Mail>, StorageError> {
            Ok(None)
        }
        fn deinit(self: Box<Self>) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn setup(readonly: bool) -> (FakeStorage, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let storage = FakeStorage {
            errors: ErrorState::new(),
            readonly,
            calls: calls.clone(),
        };
        (storage, calls)
    }

    #[test]
    fn test_closed_handle_refuses_everything() {
        let (storage, calls) = setup(false);
        let storage: &dyn MailStorage = &storage;
        let mut handle = storage.open("INBOX", None, OpenFlags::default()).unwrap();
        handle.close().unwrap();

        assert!(matches!(handle.status(StatusItems::all()), Err(StorageError::Closed(_))));
        assert!(matches!(handle.sync(SyncFlags::default()), Err(StorageError::Closed(_))));
        assert!(matches!(
            handle.transaction_begin(TransactionFlags::default()),
            Err(StorageError::Closed(_))
        ));
        assert!(matches!(handle.close(), Err(StorageError::Closed(_))));
        assert!(handle.is_inconsistent());

        let (message, syntax) = storage.get_last_error();
        assert_eq!(message.as_deref(), Some("Mailbox isn't open: INBOX"));
        assert!(!syntax);
        assert_eq!(*calls.lock().unwrap(), vec!["close"]);
    }

    #[test]
    fn test_readonly_short_circuits_mutations() {
        let (storage, calls) = setup(true);
        let storage: &dyn MailStorage = &storage;
        let mut handle = storage.open("Archive", None, OpenFlags::default()).unwrap();

        let mut t = handle.transaction_begin(TransactionFlags::default()).unwrap();
        assert!(matches!(t.keywords_create(&["$Junk"]), Err(StorageError::ReadOnly(_))));
        assert!(matches!(
            t.update_flags(1, ModifyType::Add, MailFlags::SEEN, None),
            Err(StorageError::ReadOnly(_))
        ));
        assert!(matches!(
            t.save(SaveRequest::new(&b"Subject: x\r\n\r\n"[..])),
            Err(StorageError::ReadOnly(_))
        ));
        // reads still go through
        assert!(t.search(None, &[SearchArg::All], &[]).unwrap().is_empty());
        t.rollback();

        assert!(matches!(
            handle.sync(SyncFlags {
                expunge: true,
                ..Default::default()
            }),
            Err(StorageError::ReadOnly(_))
        ));
        let (message, _) = storage.get_last_error();
        assert_eq!(message.as_deref(), Some("Mailbox is read-only: Archive"));

        drop(handle);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["transaction_begin", "search_init", "rollback", "close"]
        );
    }

    #[test]
    fn test_sync_collects_records() {
        let (storage, _calls) = setup(false);
        let storage: &dyn MailStorage = &storage;
        let mut handle = storage.open("INBOX", None, OpenFlags::default()).unwrap();
        let (records, status) = handle.sync(SyncFlags::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(status.messages, 3);
    }

    #[test]
    fn test_dropped_transaction_rolls_back_once() {
        let (storage, calls) = setup(false);
        let storage: &dyn MailStorage = &storage;
        let mut handle = storage.open("INBOX", None, OpenFlags::default()).unwrap();
        {
            let mut t = handle.transaction_begin(TransactionFlags::default()).unwrap();
            t.update_flags(1, ModifyType::Add, MailFlags::SEEN, None).unwrap();
        }
        let t = handle.transaction_begin(TransactionFlags::default()).unwrap();
        t.commit().unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| **c == "rollback").count(), 1);
        assert_eq!(calls.iter().filter(|c| **c == "commit").count(), 1);
    }
}
