use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The time-to-live of a record.
///
/// Serialized as a number of milliseconds, or `null` for [`Ttl::Forever`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<i64>", into = "Option<i64>")]
pub enum Ttl {
    /// Expires this many milliseconds after creation.
    ///
    /// Zero and negative values are valid, such records are expired right away.
    Millis(i64),
    /// Never expires.
    Forever,
}

impl Ttl {
    /// Creates a [`Ttl`] from a [`Duration`], saturating at [`i64::MAX`] milliseconds.
    pub fn from_duration(duration: Duration) -> Self {
        Self::Millis(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
    }

    /// Returns the last instant (in epoch milliseconds) at which a record created at
    /// `created_at` is still fresh, or `None` if it never expires.
    pub fn fresh_until(&self, created_at: i64) -> Option<i64> {
        match *self {
            Self::Millis(ttl) => Some(created_at.saturating_add(ttl)),
            Self::Forever => None,
        }
    }
}

impl From<Option<i64>> for Ttl {
    fn from(millis: Option<i64>) -> Self {
        millis.map_or(Self::Forever, Self::Millis)
    }
}

impl From<Ttl> for Option<i64> {
    fn from(ttl: Ttl) -> Self {
        match ttl {
            Ttl::Millis(millis) => Some(millis),
            Ttl::Forever => None,
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Millis(millis) => write!(f, "{millis}ms"),
            Self::Forever => f.write_str("forever"),
        }
    }
}

/// Metadata stamped on every record at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    /// Creation time in milliseconds since the unix epoch.
    pub created_at: i64,
    pub ttl: Ttl,
    /// Whether the record is served one last time once it expired.
    pub is_lazy: bool,
}

/// A record as persisted by a [`Storage`](crate::storage::Storage) backend.
///
/// The content is opaque to the cache. A [`Value::Null`] content is a legitimate cached value,
/// distinct from the absence of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub content: Value,
    pub meta: RecordMeta,
}

impl StoredRecord {
    /// Whether this record is expired at `now` (epoch milliseconds).
    ///
    /// A record is expired strictly *after* `created_at + ttl`, the boundary itself is still fresh.
    pub fn is_expired_at(&self, now: i64) -> bool {
        match self.meta.ttl.fresh_until(self.meta.created_at) {
            Some(fresh_until) => now > fresh_until,
            None => false,
        }
    }
}

/// A record as returned by the [`CacheContainer`](super::CacheContainer).
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry<T> {
    pub content: T,
    /// Creation time in milliseconds since the unix epoch.
    pub created_at: i64,
    /// Set when an expired lazy record is served one last time.
    pub expired: bool,
}

impl<T> CachedEntry<T> {
    /// Maps a fallible function over this entry's content.
    pub fn try_map<U, E, F>(self, f: F) -> Result<CachedEntry<U>, E>
    where
        F: FnOnce(T) -> Result<U, E>,
    {
        Ok(CachedEntry {
            content: f(self.content)?,
            created_at: self.created_at,
            expired: self.expired,
        })
    }
}
