use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::api::ApiClient;
use crate::config::ClientConfig;
use crate::notify::{Navigator, Notice, Notifier};
use crate::state::session::{SessionManager, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::error::StorageError;
use crate::utils::storage::{KeyValueStore, MemoryStore};

/// Nothing listens on the discard port, so connections are refused straight away.
pub const UNREACHABLE_URL: &str = "http://127.0.0.1:9";

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}

#[derive(Debug, Default)]
pub struct RecordingNavigator {
    routes: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, route: &str) {
        self.routes.lock().push(route.to_string());
    }
}

/// Wraps a [`MemoryStore`] and fails reads or writes of chosen keys.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failing_reads: Mutex<Vec<String>>,
    failing_writes: Mutex<Vec<String>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn fail_reads_of(&self, key: &str) {
        self.failing_reads.lock().push(key.to_string());
    }

    /// Fails the next `set_item` or `remove_item` of `key`. Queue it twice to fail twice.
    pub fn fail_next_write_of(&self, key: &str) {
        self.failing_writes.lock().push(key.to_string());
    }

    fn check_read(&self, key: &str) -> Result<(), StorageError> {
        if self.failing_reads.lock().iter().any(|k| k == key) {
            return Err(StorageError::Unavailable(format!("cannot read {key}")));
        }
        Ok(())
    }

    fn check_write(&self, key: &str) -> Result<(), StorageError> {
        let mut failing = self.failing_writes.lock();
        if let Some(pos) = failing.iter().position(|k| k == key) {
            failing.remove(pos);
            return Err(StorageError::Unavailable(format!("cannot write {key}")));
        }
        Ok(())
    }
}

impl KeyValueStore for FlakyStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_read(key)?;
        self.inner.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_write(key)?;
        self.inner.set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.check_write(key)?;
        self.inner.remove_item(key)
    }
}

pub struct Harness {
    pub session: Arc<SessionManager>,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub navigator: Arc<RecordingNavigator>,
}

impl Harness {
    pub fn new(base_url: &str) -> Self {
        Self::with_store(base_url, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(base_url: &str, store: Arc<MemoryStore>) -> Self {
        Self::with_backend(base_url, store.clone(), store)
    }

    /// A session that reads and writes through `flaky`, which wraps a fresh memory store.
    pub fn flaky(base_url: &str) -> (Self, Arc<FlakyStore>) {
        let store = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        (Self::with_backend(base_url, store, flaky.clone()), flaky)
    }

    fn with_backend(
        base_url: &str,
        store: Arc<MemoryStore>,
        backend: Arc<dyn KeyValueStore>,
    ) -> Self {
        let config = ClientConfig::with_base_url(base_url).with_timeout(Duration::from_secs(5));
        let notifier = Arc::new(RecordingNotifier::default());
        let navigator = Arc::new(RecordingNavigator::default());
        let session = SessionManager::new(ApiClient::new(config), backend)
            .with_notifier(notifier.clone())
            .with_navigator(navigator.clone());
        Self {
            session: Arc::new(session),
            store,
            notifier,
            navigator,
        }
    }

    pub fn seed_tokens(&self, access: &str, refresh: &str) {
        self.store.set_item(ACCESS_TOKEN_KEY, access).unwrap();
        self.store.set_item(REFRESH_TOKEN_KEY, refresh).unwrap();
    }

    pub fn stored_tokens(&self) -> (Option<String>, Option<String>) {
        (
            self.store.get_item(ACCESS_TOKEN_KEY).unwrap(),
            self.store.get_item(REFRESH_TOKEN_KEY).unwrap(),
        )
    }
}
