use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use mail_storage_core::{
    ErrorState, IndexHeader, MailIndex, MailStorage, OpenFlags, StatusItems, StorageError,
    StorageFlags, StorageSettings,
};
use mail_storage_dbox::bootstrap::create_indexes;
use mail_storage_dbox::uidvalidity::UIDVALIDITY_FILE_NAME;
use mail_storage_dbox::{DboxClass, FileIndex};
use tempfile::TempDir;

const CREATORS: usize = 8;

fn settings() -> StorageSettings {
    StorageSettings {
        flags: StorageFlags {
            fsync_disable: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn test_racing_bootstraps_initialize_once() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("INBOX");
    let barrier = Arc::new(Barrier::new(CREATORS));
    let inits = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..CREATORS)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let inits = Arc::clone(&inits);
            let dir = dir.clone();
            thread::spawn(move || {
                // one engine per thread, like one per process
                let index = FileIndex::open(&dir, true).unwrap();
                let errors = ErrorState::new();
                barrier.wait();
                create_indexes(&index, &errors, |_view, transaction| {
                    inits.fetch_add(1, Ordering::SeqCst);
                    transaction.update_header(IndexHeader {
                        uid_validity: 1000 + i as u32,
                        next_uid: 1,
                        first_recent_uid: 1,
                        ..Default::default()
                    });
                    Ok(())
                })
                .unwrap()
            })
        })
        .collect();

    let initialized: usize = handles
        .into_iter()
        .map(|h| usize::from(h.join().unwrap()))
        .sum();
    assert_eq!(initialized, 1);
    assert_eq!(inits.load(Ordering::SeqCst), 1);

    let view = FileIndex::open(&dir, true).unwrap().view().unwrap();
    assert!((1000..1000 + CREATORS as u32).contains(&view.header.uid_validity));
}

#[test]
fn test_racing_mailbox_creates() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().to_str().unwrap().to_string();
    // make sure the root exists before the race
    DboxClass::new().open(Some(&root), &settings()).unwrap();

    let barrier = Arc::new(Barrier::new(CREATORS));
    let handles: Vec<_> = (0..CREATORS)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let root = root.clone();
            thread::spawn(move || {
                let storage = DboxClass::new().open(Some(&root), &settings()).unwrap();
                barrier.wait();
                storage.mailbox_create("INBOX", false)
            })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(()) => created += 1,
            Err(StorageError::AlreadyExists(_)) => {}
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }
    assert!(created >= 1);

    // exactly one validity value was ever allocated, and it is the index's
    let counter = fs::read_to_string(temp.path().join(UIDVALIDITY_FILE_NAME)).unwrap();
    let allocated: u32 = counter.trim().parse().unwrap();

    let storage = DboxClass::new().open(Some(&root), &settings()).unwrap();
    let storage: &dyn MailStorage = &storage;
    let mut inbox = storage.open("INBOX", None, OpenFlags::default()).unwrap();
    let status = inbox.status(StatusItems::all()).unwrap();
    assert_eq!(status.uidvalidity, allocated);
    assert_eq!(status.messages, 0);
}
