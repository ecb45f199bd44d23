//! Backend registry and factory.
//!
//! Resolves a storage location (`"name:data"`, bare data, or empty) to a
//! live [`MailStorage`]. Registration order matters: default construction and
//! autodetection both walk the list front to back and take the first backend
//! that accepts.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::error::{RegistryError, StorageError};
use crate::storage::MailStorage;
use crate::types::{StorageFlags, StorageSettings};

/// A storage format. Immutable once registered.
pub trait StorageClass: Send + Sync {
    /// Name used in explicit `name:data` locations. Matched
    /// case-insensitively.
    fn name(&self) -> &'static str;

    /// Whether `data` looks like storage of this format, typically by probing
    /// the filesystem.
    fn autodetect(&self, data: &str, flags: StorageFlags) -> bool;

    /// Build an instance. `data == None` asks the backend to use its default
    /// location, and it may decline by returning an error.
    fn create(
        &self,
        data: Option<&str>,
        settings: &StorageSettings,
    ) -> Result<Box<dyn MailStorage>, StorageError>;
}

/// Ordered set of known backends.
///
/// Meant to be populated once at startup by the composition root and passed
/// by reference afterwards. The list is behind a mutex so registration from
/// several threads cannot corrupt it; backends are always called with the
/// lock released.
#[derive(Default)]
pub struct StorageRegistry {
    classes: Mutex<Vec<Arc<dyn StorageClass>>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a backend. Earlier registrations win autodetection.
    pub fn register(&self, class: Arc<dyn StorageClass>) {
        debug!("Registering mail storage backend {}", class.name());
        self.lock().push(class);
    }

    /// Remove `class` (compared by identity). Does nothing if it isn't
    /// registered.
    pub fn unregister(&self, class: &Arc<dyn StorageClass>) {
        let mut classes = self.lock();
        if let Some(pos) = classes.iter().position(|c| Arc::ptr_eq(c, class)) {
            let removed = classes.remove(pos);
            debug!("Unregistered mail storage backend {}", removed.name());
        }
    }

    /// Registered backends in registration order.
    pub fn classes(&self) -> Vec<Arc<dyn StorageClass>> {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn StorageClass>>> {
        self.classes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, name: &str) -> Option<Arc<dyn StorageClass>> {
        self.lock()
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Build an instance of the backend called `name`.
    ///
    /// An unknown name is [`RegistryError::UnknownBackend`], distinct from the
    /// backend failing to construct ([`RegistryError::Create`]).
    pub fn create(
        &self,
        name: &str,
        data: Option<&str>,
        settings: &StorageSettings,
    ) -> Result<Box<dyn MailStorage>, RegistryError> {
        let class = self
            .find(name)
            .ok_or_else(|| RegistryError::UnknownBackend(name.to_string()))?;
        let storage = class.create(data, settings)?;
        info!("Created {} mail storage", class.name());
        Ok(storage)
    }

    /// First backend, in registration order, that constructs with its
    /// default location.
    pub fn create_default(
        &self,
        settings: &StorageSettings,
    ) -> Result<Box<dyn MailStorage>, RegistryError> {
        for class in self.classes() {
            match class.create(None, settings) {
                Ok(storage) => {
                    info!("Created default {} mail storage", class.name());
                    return Ok(storage);
                }
                Err(e) => debug!("Backend {} declined default creation: {}", class.name(), e),
            }
        }
        Err(RegistryError::NoMatch("default location".to_string()))
    }

    /// First backend, in registration order, that recognizes `data`.
    pub fn autodetect(&self, data: &str, flags: StorageFlags) -> Option<Arc<dyn StorageClass>> {
        self.classes()
            .into_iter()
            .find(|class| class.autodetect(data, flags))
    }

    /// Resolve a storage location.
    ///
    /// - empty: [`create_default`](Self::create_default)
    /// - `name:rest` where `name` is ASCII alphanumeric: [`create`](Self::create)
    ///   with `rest`. An unknown name fails; autodetection is not tried.
    /// - anything else: autodetection, then creation with the whole string.
    pub fn create_with_data(
        &self,
        data: &str,
        settings: &StorageSettings,
    ) -> Result<Box<dyn MailStorage>, RegistryError> {
        if data.is_empty() {
            return self.create_default(settings);
        }

        if let Some((name, rest)) = split_backend_hint(data) {
            debug!("Storage location names backend {}", name);
            return self.create(name, Some(rest), settings);
        }

        let class = self
            .autodetect(data, settings.flags)
            .ok_or_else(|| RegistryError::NoMatch(data.to_string()))?;
        debug!("Autodetected {} mail storage", class.name());
        Ok(class.create(Some(data), settings)?)
    }
}

/// Split `name:rest` off `data` if it starts with an alphanumeric token
/// immediately followed by a colon.
fn split_backend_hint(data: &str) -> Option<(&str, &str)> {
    let end = data
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(data.len());
    data[end..]
        .strip_prefix(':')
        .map(|rest| (&data[..end], rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error_state::ErrorState;
    use crate::mailbox::Mailbox;
    use crate::types::{
        ListFlags, MailboxInfo, MailboxNameStatus, OpenFlags, StorageCallbacks,
    };

    struct NamedStorage {
        backend: &'static str,
        errors: ErrorState,
    }

    impl MailStorage for NamedStorage {
        fn backend_name(&self) -> &'static str {
            self.backend
        }
        fn errors(&self) -> &ErrorState {
            &self.errors
        }
        fn hierarchy_sep(&self) -> char {
            '.'
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
            Ok(MailboxNameStatus::NoExist)
        }
        fn mailbox_open(
            &self,
            name: &str,
            _input: Option<Box<dyn Read + Send>>,
            _flags: OpenFlags,
        ) -> Result<Box<dyn Mailbox + '_>, StorageError> {
            Err(self.errors.not_found(format!("Mailbox doesn't exist: {}", name)))
        }
    }

    /// Backend whose behavior is fixed at construction.
    struct TestClass {
        name: &'static str,
        accepts_default: bool,
        detects: &'static str,
        detect_calls: AtomicUsize,
        created_with: Mutex<Vec<Option<String>>>,
    }

    impl TestClass {
        fn new(name: &'static str, accepts_default: bool, detects: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                accepts_default,
                detects,
                detect_calls: AtomicUsize::new(0),
                created_with: Mutex::new(Vec::new()),
            })
        }

        fn created_with(&self) -> Vec<Option<String>> {
            self.created_with.lock().unwrap().clone()
        }
    }

    impl StorageClass for TestClass {
        fn name(&self) -> &'static str {
            self.name
        }

        fn autodetect(&self, data: &str, _flags: StorageFlags) -> bool {
            self.detect_calls.fetch_add(1, Ordering::SeqCst);
            data.starts_with(self.detects)
        }

        fn create(
            &self,
            data: Option<&str>,
            _settings: &StorageSettings,
        ) -> Result<Box<dyn MailStorage>, StorageError> {
            if data.is_none() && !self.accepts_default {
                return Err(StorageError::NotFound("no default location".into()));
            }
            self.created_with
                .lock()
                .unwrap()
                .push(data.map(str::to_string));
            Ok(Box::new(NamedStorage {
                backend: self.name,
                errors: ErrorState::new(),
            }))
        }
    }

    fn setup() -> (StorageRegistry, Arc<TestClass>, Arc<TestClass>) {
        let registry = StorageRegistry::new();
        let alpha = TestClass::new("alpha", false, "/alpha");
        let beta = TestClass::new("beta", true, "/beta");
        registry.register(alpha.clone());
        registry.register(beta.clone());
        (registry, alpha, beta)
    }

    #[test]
    fn test_explicit_name_is_case_insensitive() {
        let (registry, alpha, beta) = setup();
        let storage = registry
            .create_with_data("BETA:/var/mail", &StorageSettings::default())
            .unwrap();
        assert_eq!(storage.backend_name(), "beta");
        assert_eq!(beta.created_with(), vec![Some("/var/mail".to_string())]);
        assert_eq!(alpha.detect_calls.load(Ordering::SeqCst), 0);
        assert_eq!(beta.detect_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_explicit_name_does_not_fall_back() {
        let (registry, alpha, beta) = setup();
        let err = registry
            .create_with_data("nope:stuff", &StorageSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::UnknownBackend(ref n) if n == "nope"));
        assert!(err.is_not_found());
        assert_eq!(alpha.detect_calls.load(Ordering::SeqCst), 0);
        assert_eq!(beta.detect_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_data_takes_first_default_that_succeeds() {
        let (registry, _alpha, _beta) = setup();
        let storage = registry
            .create_with_data("", &StorageSettings::default())
            .unwrap();
        assert_eq!(storage.backend_name(), "beta");
    }

    #[test]
    fn test_create_default_none_accept() {
        let registry = StorageRegistry::new();
        registry.register(TestClass::new("alpha", false, "/alpha"));
        let err = registry
            .create_default(&StorageSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::NoMatch(_)));
    }

    #[test]
    fn test_bare_data_autodetects_in_order() {
        let registry = StorageRegistry::new();
        let first = TestClass::new("first", false, "/srv");
        let second = TestClass::new("second", false, "/srv");
        registry.register(first.clone());
        registry.register(second.clone());

        let storage = registry
            .create_with_data("/srv/mail", &StorageSettings::default())
            .unwrap();
        assert_eq!(storage.backend_name(), "first");
        assert_eq!(first.created_with(), vec![Some("/srv/mail".to_string())]);
        assert_eq!(second.detect_calls.load(Ordering::SeqCst), 0);

        let err = registry
            .create_with_data("/elsewhere", &StorageSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::NoMatch(_)));
    }

    #[test]
    fn test_path_with_colon_after_slash_is_not_a_hint() {
        let (registry, _alpha, beta) = setup();
        let storage = registry
            .create_with_data("/beta/a:b", &StorageSettings::default())
            .unwrap();
        assert_eq!(storage.backend_name(), "beta");
        assert_eq!(beta.detect_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_construction_failure_is_not_not_found() {
        let (registry, _alpha, _beta) = setup();
        // alpha refuses to build without data
        let err = registry
            .create("alpha", None, &StorageSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Create(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_unregister_by_identity() {
        let (registry, alpha, _beta) = setup();
        let alpha: Arc<dyn StorageClass> = alpha;
        let impostor: Arc<dyn StorageClass> = TestClass::new("alpha", false, "/alpha");

        registry.unregister(&impostor);
        assert_eq!(registry.classes().len(), 2);

        registry.unregister(&alpha);
        registry.unregister(&alpha);
        let names: Vec<&str> = registry.classes().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["beta"]);
    }

    #[test]
    fn test_split_backend_hint() {
        assert_eq!(split_backend_hint("dbox:/tmp/x"), Some(("dbox", "/tmp/x")));
        assert_eq!(split_backend_hint("mbox2:"), Some(("mbox2", "")));
        assert_eq!(split_backend_hint(":rest"), Some(("", "rest")));
        assert_eq!(split_backend_hint("/tmp/x:y"), None);
        assert_eq!(split_backend_hint("dbox"), None);
        assert_eq!(split_backend_hint("d-box:x"), None);
    }
}
