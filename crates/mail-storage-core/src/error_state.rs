use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use tracing::error;

use crate::error::StorageError;

/// Text shown to callers in place of a critical error's detail.
pub const CRITICAL_MSG: &str =
    "Internal error occurred. Refer to server log for more information.";

/// Format of the timestamp appended to [`CRITICAL_MSG`], whole seconds.
pub const CRITICAL_STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Snapshot of a storage instance's current error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastError {
    pub message: Option<String>,
    /// The message describes malformed caller input and is safe to echo.
    pub syntax: bool,
}

/// The single live error of a storage instance.
///
/// Every setter replaces the previous error. Critical details are logged via
/// `tracing::error!` and replaced by [`CRITICAL_MSG`] plus a timestamp, so an
/// operator can find the detail in the log while the caller only sees the
/// placeholder.
#[derive(Debug, Default)]
pub struct ErrorState {
    last: Mutex<LastError>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LastError> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, message: Option<String>, syntax: bool) {
        *self.lock() = LastError { message, syntax };
    }

    /// Drop the current error and reset the classification.
    pub fn clear(&self) {
        self.store(None, false);
    }

    /// Store a caller-facing message. `None` is the "no error" state.
    pub fn set_error(&self, message: impl Into<Option<String>>) {
        self.store(message.into(), false);
    }

    /// Store a message describing malformed caller input.
    pub fn set_syntax_error(&self, message: impl Into<Option<String>>) {
        let message = message.into();
        let syntax = message.is_some();
        self.store(message, syntax);
    }

    /// Store the generic internal error placeholder and return it.
    pub fn set_internal_error(&self) -> String {
        let message = internal_error_message(Local::now());
        self.store(Some(message.clone()), false);
        message
    }

    /// Log `detail` to the diagnostic channel and store the sanitized
    /// placeholder. `None` clears the error without logging anything.
    pub fn set_critical(&self, detail: impl Into<Option<String>>) -> Option<String> {
        match detail.into() {
            None => {
                self.store(None, false);
                None
            }
            Some(detail) => {
                error!(target: "mail_storage", "{}", detail);
                Some(self.set_internal_error())
            }
        }
    }

    /// The current error and whether it is a syntax error. Never mutates.
    pub fn get_last_error(&self) -> (Option<String>, bool) {
        let last = self.lock();
        (last.message.clone(), last.syntax)
    }

    pub fn last_error(&self) -> LastError {
        self.lock().clone()
    }

    // Setters that also hand back the matching error value for `?` call sites.

    pub fn not_found(&self, message: impl Into<String>) -> StorageError {
        let message = message.into();
        self.set_error(message.clone());
        StorageError::NotFound(message)
    }

    pub fn already_exists(&self, message: impl Into<String>) -> StorageError {
        let message = message.into();
        self.set_error(message.clone());
        StorageError::AlreadyExists(message)
    }

    pub fn syntax(&self, message: impl Into<String>) -> StorageError {
        let message = message.into();
        self.set_syntax_error(message.clone());
        StorageError::Syntax(message)
    }

    pub fn read_only(&self, message: impl Into<String>) -> StorageError {
        let message = message.into();
        self.set_error(message.clone());
        StorageError::ReadOnly(message)
    }

    pub fn closed(&self, message: impl Into<String>) -> StorageError {
        let message = message.into();
        self.set_error(message.clone());
        StorageError::Closed(message)
    }

    pub fn internal(&self) -> StorageError {
        StorageError::Internal(self.set_internal_error())
    }

    pub fn critical(&self, detail: impl fmt::Display) -> StorageError {
        let message = self
            .set_critical(detail.to_string())
            .unwrap_or_else(|| CRITICAL_MSG.to_string());
        StorageError::Internal(message)
    }

    /// Access denied on `path`. The detail goes to the log like any critical
    /// error; the returned kind still tells the caller it was a permission
    /// problem.
    pub fn permission_denied(&self, op: &str, path: &Path) -> StorageError {
        let message = self
            .set_critical(eacces_message(op, path))
            .unwrap_or_else(|| CRITICAL_MSG.to_string());
        StorageError::PermissionDenied(message)
    }

    /// Classify a failed filesystem call: absence becomes NotFound with
    /// `not_found_msg`, access denial and everything else become critical.
    pub fn io(
        &self,
        op: &str,
        path: &Path,
        err: &io::Error,
        not_found_msg: impl FnOnce() -> String,
    ) -> StorageError {
        match err.kind() {
            io::ErrorKind::NotFound => self.not_found(not_found_msg()),
            io::ErrorKind::PermissionDenied => self.permission_denied(op, path),
            _ => self.critical(format_args!("{}({}) failed: {}", op, path.display(), err)),
        }
    }
}

/// The placeholder for an internal error that happened at `now`.
pub fn internal_error_message(now: DateTime<Local>) -> String {
    format!("{} [{}]", CRITICAL_MSG, now.format(CRITICAL_STAMP_FORMAT))
}

/// Fixed text for an access-denied failure of `op` on `path`.
pub fn eacces_message(op: &str, path: &Path) -> String {
    format!("{}({}) failed: Permission denied", op, path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn stamp_of(message: &str) -> NaiveDateTime {
        let stamp = message
            .strip_prefix(CRITICAL_MSG)
            .and_then(|s| s.strip_prefix(" ["))
            .and_then(|s| s.strip_suffix(']'))
            .expect("placeholder with timestamp");
        NaiveDateTime::parse_from_str(stamp, CRITICAL_STAMP_FORMAT).unwrap()
    }

    #[test]
    fn test_starts_empty() {
        let state = ErrorState::new();
        assert_eq!(state.get_last_error(), (None, false));
    }

    #[test]
    fn test_set_error_is_not_syntax() {
        let state = ErrorState::new();
        state.set_error(format!("Mailbox doesn't exist: {}", "INBOX"));
        assert_eq!(
            state.get_last_error(),
            (Some("Mailbox doesn't exist: INBOX".to_string()), false)
        );
    }

    #[test]
    fn test_set_syntax_error_verbatim() {
        let state = ErrorState::new();
        state.set_syntax_error("Unknown charset: KOI8-X".to_string());
        assert_eq!(
            state.get_last_error(),
            (Some("Unknown charset: KOI8-X".to_string()), true)
        );
    }

    #[test]
    fn test_none_is_no_error() {
        let state = ErrorState::new();
        state.set_error("something".to_string());
        state.set_error(None::<String>);
        assert_eq!(state.get_last_error(), (None, false));
    }

    #[test]
    fn test_new_error_replaces_previous() {
        let state = ErrorState::new();
        state.set_syntax_error("first".to_string());
        state.set_error("second".to_string());
        let (message, syntax) = state.get_last_error();
        assert_eq!(message.as_deref(), Some("second"));
        assert!(!syntax);
    }

    #[test]
    fn test_critical_hides_detail() {
        let state = ErrorState::new();
        let before = Local::now().naive_local();
        let err = state.critical("open(/home/alice/dbox/INBOX) failed: EIO");
        let after = Local::now().naive_local();

        let (message, syntax) = state.get_last_error();
        let message = message.unwrap();
        assert!(!syntax);
        assert!(!message.contains("/home/alice"));
        assert!(message.starts_with(CRITICAL_MSG));
        assert_eq!(err, StorageError::Internal(message.clone()));

        let stamp = stamp_of(&message);
        // whole-second precision: the stamp may truncate `before`
        assert!(stamp >= before - chrono::Duration::seconds(1));
        assert!(stamp <= after + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_set_critical_none_clears() {
        let state = ErrorState::new();
        state.set_error("old".to_string());
        assert_eq!(state.set_critical(None::<String>), None);
        assert_eq!(state.get_last_error(), (None, false));
    }

    #[test]
    fn test_clear_resets_syntax_flag() {
        let state = ErrorState::new();
        state.set_syntax_error("bad".to_string());
        state.clear();
        assert_eq!(state.get_last_error(), (None, false));
    }

    #[test]
    fn test_get_last_error_does_not_mutate() {
        let state = ErrorState::new();
        state.set_error("kept".to_string());
        let first = state.get_last_error();
        let second = state.get_last_error();
        assert_eq!(first, second);
    }

    #[test]
    fn test_io_classification() {
        let state = ErrorState::new();
        let path = Path::new("/srv/mail/box");

        let err = io::Error::from(io::ErrorKind::NotFound);
        let not_found = state.io("stat", path, &err, || "Mailbox doesn't exist: box".into());
        assert_eq!(not_found, StorageError::NotFound("Mailbox doesn't exist: box".into()));

        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        let denied = state.io("stat", path, &err, || unreachable!());
        assert!(matches!(denied, StorageError::PermissionDenied(_)));
        assert!(!denied.message().contains("/srv/mail"));

        let err = io::Error::other("disk on fire");
        let other = state.io("stat", path, &err, || unreachable!());
        assert!(other.is_internal());
        assert!(other.message().starts_with(CRITICAL_MSG));
    }
}
