//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`), otherwise the directory is gone before the storage
//!    gets to use it.
//!
//!  - Use [`ManualClock`] instead of sleeping to test expiry. Records are stamped and expired
//!    by the clock of the container, so moving it forward is all it takes.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use ttlcache::caching::{Clock, StoredRecord};
use ttlcache::storage::{Storage, StorageError};

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `ttlcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("ttlcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Creates a clock standing at `now` milliseconds since the unix epoch.
    pub fn new(now: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(now),
        })
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// The number of calls a [`CountingStorage`] has seen, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageCounts {
    pub get: usize,
    pub set: usize,
    pub remove: usize,
    pub clear: usize,
}

/// A [`Storage`] that counts the calls it forwards to an inner storage.
#[derive(Debug, Default)]
pub struct CountingStorage<S> {
    inner: S,
    get: AtomicUsize,
    set: AtomicUsize,
    remove: AtomicUsize,
    clear: AtomicUsize,
}

impl<S> CountingStorage<S> {
    pub fn new(inner: S) -> Arc<Self> {
        Arc::new(Self {
            inner,
            get: AtomicUsize::new(0),
            set: AtomicUsize::new(0),
            remove: AtomicUsize::new(0),
            clear: AtomicUsize::new(0),
        })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn counts(&self) -> StorageCounts {
        StorageCounts {
            get: self.get.load(Ordering::SeqCst),
            set: self.set.load(Ordering::SeqCst),
            remove: self.remove.load(Ordering::SeqCst),
            clear: self.clear.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl<S: Storage> Storage for CountingStorage<S> {
    async fn get_item(&self, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        self.get.fetch_add(1, Ordering::SeqCst);
        self.inner.get_item(key).await
    }

    async fn set_item(&self, key: &str, record: StoredRecord) -> Result<(), StorageError> {
        self.set.fetch_add(1, Ordering::SeqCst);
        self.inner.set_item(key, record).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.remove.fetch_add(1, Ordering::SeqCst);
        self.inner.remove_item(key).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.clear.fetch_add(1, Ordering::SeqCst);
        self.inner.clear().await
    }
}
