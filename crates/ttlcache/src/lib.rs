//! A time-to-live caching layer for expensive asynchronous computations.
//!
//! The crate is organized around three pieces, all living in [`caching`]:
//!
//! - The [`CacheContainer`](caching::CacheContainer) owns expiry decisions and talks to a
//!   [`Storage`](storage::Storage) backend.
//! - The [`Coalescer`](caching::Coalescer) makes sure concurrent requests for the same
//!   [`CacheKey`](caching::CacheKey) share a single computation.
//! - [`CacheKey`](caching::CacheKey) derivation turns an operation name and its arguments
//!   into a stable key.
//!
//! Storage backends, configuration, logging and metrics are provided by the remaining modules.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod storage;
