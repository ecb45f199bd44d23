use thiserror::Error;

/// Errors surfaced by a storage instance or one of its mailboxes.
///
/// The payload is always the caller-facing text, i.e. the same string the
/// storage's [`ErrorState`](crate::ErrorState) holds after the failure.
/// Internal detail never ends up in here; see
/// [`ErrorState::critical`](crate::ErrorState::critical).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Syntax(String),

    #[error("{0}")]
    ReadOnly(String),

    #[error("{0}")]
    Closed(String),

    #[error("{0}")]
    Internal(String),
}

impl StorageError {
    /// The caller-facing message.
    pub fn message(&self) -> &str {
        match self {
            StorageError::NotFound(msg)
            | StorageError::AlreadyExists(msg)
            | StorageError::PermissionDenied(msg)
            | StorageError::Syntax(msg)
            | StorageError::ReadOnly(msg)
            | StorageError::Closed(msg)
            | StorageError::Internal(msg) => msg,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, StorageError::Internal(_))
    }
}

/// Errors reported by an index engine.
///
/// These carry internal detail (paths, OS errors) and must be routed through
/// [`ErrorState::critical`](crate::ErrorState::critical) before reaching a caller.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Index corrupted: {0}")]
    Corrupted(String),
}

/// Errors from resolving a storage location through the registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// An explicit `name:` hint named no registered backend.
    #[error("Unknown mail storage backend: {0}")]
    UnknownBackend(String),

    /// No backend accepted the data (default construction or autodetection).
    #[error("Couldn't find a mail storage backend for: {0}")]
    NoMatch(String),

    /// The chosen backend was found but failed to construct an instance.
    #[error(transparent)]
    Create(#[from] StorageError),
}

impl RegistryError {
    /// True for both not-found signals, false for construction failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::UnknownBackend(_) | RegistryError::NoMatch(_)
        )
    }
}
