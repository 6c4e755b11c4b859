//! Storage backends for cache records.
//!
//! A [`Storage`] is a plain key/value store of [`StoredRecord`]s. It knows nothing about
//! expiration: all expiry decisions are made by the
//! [`CacheContainer`](crate::caching::CacheContainer) on top of it, which also stamps the
//! record metadata.
//!
//! Two backends are provided:
//!
//! - [`MemoryStorage`] keeps records in process memory.
//! - [`FilesystemStorage`] keeps one JSON file per record in a directory tree.

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::caching::StoredRecord;
use crate::config::StorageConfig;

mod filesystem;
mod memory;

pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;

/// An error raised by a [`Storage`] backend.
///
/// These are surfaced to callers of the cache unchanged.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the backing store failed.
    #[error("storage I/O failed")]
    Io(#[from] io::Error),
    /// A record could not be encoded for, or decoded from, the backing store.
    #[error("failed to encode or decode a stored record")]
    Serialization(#[from] serde_json::Error),
    /// Any other backend specific failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A minimal asynchronous key/value store of [`StoredRecord`]s.
///
/// Implementations must treat removal of an absent key as a no-op, and [`clear`](Self::clear)
/// should not leave a partially cleared state observable once it returns.
#[async_trait]
pub trait Storage: fmt::Debug + Send + Sync {
    /// Returns the record stored under `key`, if any.
    async fn get_item(&self, key: &str) -> Result<Option<StoredRecord>, StorageError>;

    /// Stores `record` under `key`, replacing any previous record.
    async fn set_item(&self, key: &str, record: StoredRecord) -> Result<(), StorageError>;

    /// Removes the record stored under `key`.
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// Removes all records.
    async fn clear(&self) -> Result<(), StorageError>;
}

#[async_trait]
impl<S: Storage + ?Sized> Storage for Arc<S> {
    async fn get_item(&self, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        (**self).get_item(key).await
    }

    async fn set_item(&self, key: &str, record: StoredRecord) -> Result<(), StorageError> {
        (**self).set_item(key, record).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove_item(key).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        (**self).clear().await
    }
}

/// Creates the storage backend described by `config`.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    let storage: Arc<dyn Storage> = match config {
        StorageConfig::Memory => Arc::new(MemoryStorage::default()),
        StorageConfig::Filesystem { path } => Arc::new(FilesystemStorage::new(path)?),
    };
    tracing::debug!(?storage, "Created cache storage");
    Ok(storage)
}
