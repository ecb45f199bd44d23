//! One-time index creation.
//!
//! There is no lock file. Exclusion comes entirely from the index engine's
//! guarantee that only one sync scope per index is active at a time, across
//! processes: racing creators queue up in `sync_begin`, the first one finds
//! an unset UID validity and initializes, the rest find it set and commit
//! nothing. An engine without that guarantee would break "exactly once".

use mail_storage_core::{
    ErrorState, IndexSyncFlags, IndexTransaction, IndexView, MailIndex, StorageError, SyncBegin,
};
use tracing::{debug, instrument};

/// Initialize the index of an already opened mailbox unless another creator
/// got there first.
///
/// `init` runs only when the view's UID validity is unset and must record
/// the initial header into the transaction. Returns whether this call did
/// the initialization.
///
/// Every failure here is the index engine's, so it is reported as critical.
#[instrument(skip_all, level = "debug")]
pub fn create_indexes<F>(
    index: &dyn MailIndex,
    errors: &ErrorState,
    init: F,
) -> Result<bool, StorageError>
where
    F: FnOnce(&IndexView, &mut IndexTransaction) -> Result<(), StorageError>,
{
    // use syncing as a lock
    let mut scope = match index.sync_begin(IndexSyncFlags::default()) {
        Ok(SyncBegin::Started(scope)) => scope,
        Ok(SyncBegin::NothingToSync(Some(scope))) => {
            debug!("Nothing to sync, checking header anyway");
            scope
        }
        Ok(SyncBegin::NothingToSync(None)) => {
            // the engine said "nothing to sync" and gave no view to check
            let err = errors.critical("Index sync began without a view to inspect");
            index.reset_error();
            return Err(err);
        }
        Err(e) => {
            let err = errors.critical(format_args!("Index sync failed: {}", e));
            index.reset_error();
            return Err(err);
        }
    };

    let mut initialized = false;
    if scope.header().uid_validity == 0 {
        let view = scope.view().clone();
        if let Err(e) = init(&view, scope.transaction()) {
            scope.rollback();
            return Err(e);
        }
        initialized = true;
    } else {
        debug!(
            "Index already initialized with uid validity {}",
            scope.header().uid_validity
        );
    }

    scope
        .commit()
        .map_err(|e| errors.critical(format_args!("Committing index sync failed: {}", e)))?;
    Ok(initialized)
}
