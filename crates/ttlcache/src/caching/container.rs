use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::storage::Storage;

use super::{CacheError, CachedEntry, CachingOptions, RecordMeta, StoredRecord};

/// A source of wall clock time.
pub trait Clock: fmt::Debug + Send + Sync {
    /// Milliseconds since the unix epoch.
    fn now_millis(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Reads and writes records while enforcing their expiry policy.
///
/// The container is the only component that talks to the [`Storage`]. Expired records are
/// removed from storage whenever they are touched by [`get`](Self::get), independent of their
/// policy. The policy only decides what the caller gets to see:
///
/// - A *lazy* record is returned one last time, flagged as
///   [`expired`](CachedEntry::expired).
/// - An *eager* record is reported as absent.
///
/// Storage failures are passed on to the caller and never retried.
#[derive(Debug, Clone)]
pub struct CacheContainer {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl CacheContainer {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used to stamp and expire records.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Looks up the record for `key` without interpreting its content.
    pub async fn get_raw(&self, key: &str) -> Result<Option<CachedEntry<Value>>, CacheError> {
        metric!(counter("caches.access") += 1);

        let Some(record) = self.storage.get_item(key).await? else {
            tracing::trace!(key, "Cache miss");
            metric!(counter("caches.miss") += 1, "reason" => "absent");
            return Ok(None);
        };

        let now = self.clock.now_millis();
        if !record.is_expired_at(now) {
            tracing::trace!(key, "Cache hit");
            metric!(counter("caches.hit") += 1);
            return Ok(Some(CachedEntry {
                content: record.content,
                created_at: record.meta.created_at,
                expired: false,
            }));
        }

        tracing::trace!(
            key,
            created_at = record.meta.created_at,
            ttl = %record.meta.ttl,
            is_lazy = record.meta.is_lazy,
            "Removing expired record"
        );
        self.storage.remove_item(key).await?;

        if record.meta.is_lazy {
            metric!(counter("caches.stale") += 1);
            Ok(Some(CachedEntry {
                content: record.content,
                created_at: record.meta.created_at,
                expired: true,
            }))
        } else {
            metric!(counter("caches.miss") += 1, "reason" => "expired");
            Ok(None)
        }
    }

    /// Looks up the record for `key` and deserializes its content as `T`.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::Deserialize`] if the content does not have the shape of `T`, and
    /// with [`CacheError::Storage`] if the storage fails.
    pub async fn get<T>(&self, key: &str) -> Result<Option<CachedEntry<T>>, CacheError>
    where
        T: DeserializeOwned,
    {
        match self.get_raw(key).await? {
            Some(entry) => entry
                .try_map(serde_json::from_value)
                .map(Some)
                .map_err(CacheError::deserialize),
            None => Ok(None),
        }
    }

    /// Writes `content` under `key`, replacing any previous record.
    ///
    /// A `None` or unit content is a record like any other and is distinct from an absent key.
    pub async fn set<T>(
        &self,
        key: &str,
        content: &T,
        options: &CachingOptions,
    ) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let content = serde_json::to_value(content).map_err(CacheError::serialize)?;
        self.set_raw(key, content, options).await
    }

    /// Writes an already serialized `content` under `key`.
    pub async fn set_raw(
        &self,
        key: &str,
        content: Value,
        options: &CachingOptions,
    ) -> Result<(), CacheError> {
        let meta = RecordMeta {
            created_at: self.clock.now_millis(),
            ttl: options.effective_ttl(),
            is_lazy: options.effective_lazy(),
        };
        tracing::trace!(key, ttl = %meta.ttl, is_lazy = meta.is_lazy, "Writing record");

        self.storage
            .set_item(key, StoredRecord { content, meta })
            .await?;
        Ok(())
    }

    /// Removes the record for `key`. Removing an absent key is not an error.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        metric!(counter("caches.remove") += 1);
        self.storage.remove_item(key).await?;
        Ok(())
    }

    /// Removes all records.
    pub async fn clear(&self) -> Result<(), CacheError> {
        metric!(counter("caches.clear") += 1);
        self.storage.clear().await?;
        tracing::debug!("Cleared cache");
        Ok(())
    }
}
