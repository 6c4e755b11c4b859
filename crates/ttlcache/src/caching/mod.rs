//! Core caching infrastructure.
//!
//! # Records
//!
//! Every cached value is persisted as a [`StoredRecord`]: the serialized content along with
//! the time it was written, its time-to-live and its expiry policy. The policy is fixed at write
//! time and decides what happens once the record expired:
//!
//! - *Eager* records are hidden right away.
//! - *Lazy* records are served one more time, flagged as expired, so the caller can refresh them.
//!
//! In both cases the expired record is removed from storage the moment it is read. There is no
//! background sweeping, records that are never read again stay in storage.
//!
//! A record with a [`Ttl::Forever`] never expires.
//!
//! # Lookups and computations
//!
//! The [`CacheContainer`] reads and writes records and applies the policy on read. On top of it,
//! the [`Coalescer`] makes sure that concurrent lookups for the same [`CacheKey`] share a single
//! computation, and only one record is written for all of them.
//!
//! Keys are usually derived from an operation name, a prefix and the call arguments, see
//! [`KeyStrategy`]. [`Coalescer::wrap`] bundles all of this into a plain function:
//!
//! ```
//! # async fn doc() -> Result<(), ttlcache::caching::CacheError> {
//! use std::sync::Arc;
//! use ttlcache::caching::{CacheContainer, CachingOptions, Coalescer};
//! use ttlcache::storage::MemoryStorage;
//!
//! let coalescer = Coalescer::new(CacheContainer::new(Arc::new(MemoryStorage::new())));
//! let fetch_user = coalescer.wrap("fetchUser", CachingOptions::default(), |id: u32| async move {
//!     Ok::<_, std::io::Error>(format!("user {id}"))
//! });
//!
//! let user: String = fetch_user.call(7).await?;
//! assert_eq!(user, "user 7");
//! # Ok(())
//! # }
//! ```

mod cache_error;
mod cache_key;
mod coalescer;
mod container;
mod options;
mod record;

pub use cache_error::CacheError;
pub use cache_key::{CacheKey, KeyInput, KeyStrategy, hashed_path};
pub use coalescer::{CachedFn, Coalescer};
pub use container::{CacheContainer, Clock, SystemClock};
pub use options::{CachingOptions, DEFAULT_TTL};
pub use record::{CachedEntry, RecordMeta, StoredRecord, Ttl};
