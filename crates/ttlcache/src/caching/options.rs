use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CachingConfig;

use super::{CacheKey, KeyStrategy, Ttl};

/// The time-to-live used when none is configured.
pub const DEFAULT_TTL: Ttl = Ttl::Millis(60_000);

type StaleCallback = dyn Fn(&CacheKey) + Send + Sync;

/// Per-operation caching options.
///
/// ```
/// use std::time::Duration;
/// use ttlcache::caching::CachingOptions;
///
/// let options = CachingOptions::default()
///     .ttl(Duration::from_millis(500))
///     .lazy(false)
///     .prefix("users");
/// ```
#[derive(Clone)]
pub struct CachingOptions {
    /// Time-to-live of written records.
    pub ttl: Ttl,
    /// Whether expired records are served one last time before being dropped.
    pub is_lazy: bool,
    /// Writes records that never expire, regardless of `ttl` and `is_lazy`.
    pub is_cached_forever: bool,
    /// Part of every derived key.
    pub prefix: String,
    pub key_strategy: KeyStrategy,
    /// Recompute in the background when a stale record is served.
    pub refresh_stale: bool,
    /// Invoked once for every stale record that is served.
    pub on_stale: Option<Arc<StaleCallback>>,
}

impl CachingOptions {
    /// Creates options with the defaults from the `caching` config section.
    pub fn from_config(config: &CachingConfig) -> Self {
        Self {
            ttl: config.default_ttl.map_or(Ttl::Forever, Ttl::from_duration),
            is_lazy: config.is_lazy,
            prefix: config.prefix.clone(),
            refresh_stale: config.refresh_stale,
            ..Default::default()
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Ttl::from_duration(ttl);
        self
    }

    /// Sets the time-to-live in milliseconds, which may be zero or negative.
    pub fn ttl_millis(mut self, millis: i64) -> Self {
        self.ttl = Ttl::Millis(millis);
        self
    }

    pub fn lazy(mut self, is_lazy: bool) -> Self {
        self.is_lazy = is_lazy;
        self
    }

    pub fn forever(mut self, is_cached_forever: bool) -> Self {
        self.is_cached_forever = is_cached_forever;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    pub fn refresh_stale(mut self, refresh_stale: bool) -> Self {
        self.refresh_stale = refresh_stale;
        self
    }

    pub fn on_stale<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheKey) + Send + Sync + 'static,
    {
        self.on_stale = Some(Arc::new(f));
        self
    }

    /// The ttl a record written with these options gets.
    pub fn effective_ttl(&self) -> Ttl {
        match self.is_cached_forever {
            true => Ttl::Forever,
            false => self.ttl,
        }
    }

    /// The expiry policy a record written with these options gets.
    ///
    /// Records that are cached forever never expire, so their policy is irrelevant and
    /// stored as eager.
    pub fn effective_lazy(&self) -> bool {
        !self.is_cached_forever && self.is_lazy
    }
}

impl Default for CachingOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            is_lazy: true,
            is_cached_forever: false,
            prefix: "default".into(),
            key_strategy: KeyStrategy::default(),
            refresh_stale: false,
            on_stale: None,
        }
    }
}

impl fmt::Debug for CachingOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingOptions")
            .field("ttl", &self.ttl)
            .field("is_lazy", &self.is_lazy)
            .field("is_cached_forever", &self.is_cached_forever)
            .field("prefix", &self.prefix)
            .field("key_strategy", &self.key_strategy)
            .field("refresh_stale", &self.refresh_stale)
            .field("on_stale", &self.on_stale.is_some())
            .finish()
    }
}
