use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::caching::StoredRecord;

use super::{Storage, StorageError};

/// Keeps records in a map in process memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, StoredRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records, expired ones included.
    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    fn items(&self) -> MutexGuard<'_, HashMap<String, StoredRecord>> {
        // The map is never left in an inconsistent state, so a poisoned lock is still usable.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        Ok(self.items().get(key).cloned())
    }

    async fn set_item(&self, key: &str, record: StoredRecord) -> Result<(), StorageError> {
        self.items().insert(key.to_owned(), record);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.items().clear();
        Ok(())
    }
}
