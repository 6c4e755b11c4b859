use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::Config;
use crate::storage::{self, StorageError};

use super::{CacheContainer, CacheError, CacheKey, CachingOptions};

type ComputationResult = Result<Arc<Value>, CacheError>;
// `Shared` needs a `Clone` output, which is why the content is behind an `Arc`.
type ComputationChannel = Shared<oneshot::Receiver<ComputationResult>>;

type ComputationMap = Arc<Mutex<BTreeMap<CacheKey, ComputationChannel>>>;

fn lock_computations(
    computations: &Mutex<BTreeMap<CacheKey, ComputationChannel>>,
) -> MutexGuard<'_, BTreeMap<CacheKey, ComputationChannel>> {
    // Every mutation is a single insert or remove, the map is consistent even after a panic.
    computations.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Evicts a computation from the in-flight map when dropped.
struct ComputationToken {
    key: CacheKey,
    computations: ComputationMap,
}

impl Drop for ComputationToken {
    fn drop(&mut self) {
        let mut computations = lock_computations(&self.computations);
        computations.remove(&self.key);
        metric!(gauge("caches.computations") = computations.len() as u64);
    }
}

/// Deduplicates concurrent cache lookups and computations.
///
/// All callers of [`execute`](Self::execute) that overlap in time for the same [`CacheKey`] share
/// a single computation. The first caller registers it in the in-flight map, every later caller
/// attaches to it and receives the same result or error.
///
/// The registered computation runs as its own task and does the whole round trip:
///
/// 1. Look up the key in the [`CacheContainer`].
/// 2. On a miss, invoke the producer exactly once and write its result.
/// 3. Evict itself from the in-flight map.
/// 4. Hand the result to all waiters.
///
/// Because eviction only happens once the result has been written, a new caller either finds
/// the in-flight computation or the cached record, never neither. Dropping a waiter does not
/// cancel the computation.
///
/// A failed producer is not cached. Its error is delivered as [`CacheError::Computation`] to all
/// waiters of that computation, and the next call starts a fresh one.
///
/// The in-flight map is per instance. Two coalescers over the same storage do not deduplicate
/// against each other.
#[derive(Clone)]
pub struct Coalescer {
    container: CacheContainer,

    /// Used for deduplicating cache lookups.
    current_computations: ComputationMap,
}

impl fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("container", &self.container)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Coalescer {
    pub fn new(container: CacheContainer) -> Self {
        Self {
            container,
            current_computations: Default::default(),
        }
    }

    /// Creates a coalescer over the storage backend described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        let storage = storage::from_config(&config.storage)?;
        Ok(Self::new(CacheContainer::new(storage)))
    }

    pub fn container(&self) -> &CacheContainer {
        &self.container
    }

    /// The number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        lock_computations(&self.current_computations).len()
    }

    /// Returns the value cached under `key`, computing it with `producer` if needed.
    ///
    /// A fresh record is returned as is. A lazily expired record is returned one last time and
    /// triggers [`CachingOptions::on_stale`], and with [`CachingOptions::refresh_stale`] also a
    /// recomputation. Otherwise `producer` is invoked, at most once for all concurrent callers
    /// of the same key, and its result is written with `options`.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Computation`] if the producer failed.
    /// - [`CacheError::Storage`] if reading or writing the storage failed.
    /// - [`CacheError::Serialize`] or [`CacheError::Deserialize`] if the value does not
    ///   round-trip through JSON.
    /// - [`CacheError::Cancelled`] if the computation task went away, for example by panicking.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: CacheKey,
        options: &CachingOptions,
        producer: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: StdError + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let content = self
            .spawn_computation(key, options.clone(), producer)
            .await?;
        T::deserialize(content.as_ref()).map_err(CacheError::deserialize)
    }

    /// Wraps `producer` into a function that caches its results.
    ///
    /// Keys are derived from the call arguments with the configured
    /// [`KeyStrategy`](super::KeyStrategy), see [`CachedFn::call`].
    pub fn wrap<F>(
        &self,
        operation_name: impl Into<String>,
        options: CachingOptions,
        producer: F,
    ) -> CachedFn<F> {
        CachedFn {
            coalescer: self.clone(),
            operation_name: operation_name.into(),
            method_name: None,
            options,
            producer: Arc::new(producer),
        }
    }

    /// Spawns the lookup as a separate task, or attaches to one in flight for the same key.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly register and spawn
    /// the computation under the lock, even if you don't explicitly `await` its results.
    fn spawn_computation<T, E, F, Fut>(
        &self,
        key: CacheKey,
        options: CachingOptions,
        producer: F,
    ) -> BoxFuture<'static, ComputationResult>
    where
        T: Serialize + Send + 'static,
        E: StdError + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let channel = {
            let mut current_computations = lock_computations(&self.current_computations);
            if let Some(channel) = current_computations.get(&key) {
                // A concurrent cache lookup was deduplicated.
                metric!(counter("caches.channel.hit") += 1);
                tracing::debug!(%key, "Attaching to in-flight computation");
                channel.clone()
            } else {
                // A concurrent cache lookup is considered new. This does not imply a cache miss.
                metric!(counter("caches.channel.miss") += 1);
                let channel = self.create_channel(key.clone(), options, producer);
                let evicted = current_computations.insert(key, channel.clone());
                debug_assert!(evicted.is_none());
                metric!(gauge("caches.computations") = current_computations.len() as u64);
                channel
            }
        };

        channel
            .unwrap_or_else(|_cancelled| Err(CacheError::Cancelled))
            .boxed()
    }

    /// Spawns the task for a new computation and returns a channel to its result.
    fn create_channel<T, E, F, Fut>(
        &self,
        key: CacheKey,
        options: CachingOptions,
        producer: F,
    ) -> ComputationChannel
    where
        T: Serialize + Send + 'static,
        E: StdError + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let token = ComputationToken {
            key: key.clone(),
            computations: self.current_computations.clone(),
        };

        let task = run_computation(
            self.container.clone(),
            key,
            options,
            producer,
            token,
            sender,
        )
        .bind_hub(Hub::new_from_top(Hub::current()));

        // The lock on the map is still held, so the task cannot evict itself before it was
        // inserted.
        tokio::spawn(task);

        receiver.shared()
    }
}

/// The body of a registered computation.
///
/// The token is dropped before the result is sent. Callers thus either get a channel that will
/// receive data, or they register a new one after the record was written.
async fn run_computation<T, E, F, Fut>(
    container: CacheContainer,
    key: CacheKey,
    options: CachingOptions,
    producer: F,
    token: ComputationToken,
    sender: oneshot::Sender<ComputationResult>,
) where
    T: Serialize,
    E: StdError + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let stale = match container.get_raw(key.as_str()).await {
        Ok(Some(entry)) if !entry.expired => {
            drop(token);
            sender.send(Ok(Arc::new(entry.content))).ok();
            return;
        }
        Ok(Some(entry)) => Arc::new(entry.content),
        Ok(None) => {
            let result = compute_and_store(&container, &key, &options, producer).await;
            drop(token);
            sender.send(result).ok();
            return;
        }
        Err(err) => {
            drop(token);
            sender.send(Err(err)).ok();
            return;
        }
    };

    tracing::debug!(%key, refresh = options.refresh_stale, "Serving stale record");
    if options.refresh_stale {
        // Waiters get the stale value right away, while the entry stays registered until the
        // refreshed record is written. Concurrent callers are served the same stale value.
        sender.send(Ok(stale)).ok();
        if let Err(err) = compute_and_store(&container, &key, &options, producer).await {
            let dynerr: &dyn StdError = &err;
            tracing::warn!(error = dynerr, %key, "Refreshing stale record failed");
        }
        drop(token);
    } else {
        drop(token);
        sender.send(Ok(stale)).ok();
    }

    if let Some(on_stale) = options.on_stale {
        on_stale(&key);
    }
}

/// Invokes the producer and writes its result to the cache.
///
/// Nothing is written if the producer fails.
async fn compute_and_store<T, E, F, Fut>(
    container: &CacheContainer,
    key: &CacheKey,
    options: &CachingOptions,
    producer: F,
) -> ComputationResult
where
    T: Serialize,
    E: StdError + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    metric!(counter("caches.computation") += 1);
    let start = Instant::now();
    let result = producer().await;
    metric!(timer("caches.computation.duration") = start.elapsed());

    let content = match result {
        Ok(content) => content,
        Err(err) => {
            metric!(counter("caches.computation.failed") += 1);
            let dynerr: &dyn StdError = &err;
            tracing::debug!(error = dynerr, %key, "Cache computation failed");
            return Err(CacheError::computation(err));
        }
    };

    let content = serde_json::to_value(&content).map_err(CacheError::serialize)?;
    container
        .set_raw(key.as_str(), content.clone(), options)
        .await?;
    Ok(Arc::new(content))
}

/// A producer wrapped by [`Coalescer::wrap`].
pub struct CachedFn<F> {
    coalescer: Coalescer,
    operation_name: String,
    method_name: Option<String>,
    options: CachingOptions,
    producer: Arc<F>,
}

impl<F> Clone for CachedFn<F> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            coalescer: self.coalescer.clone(),
            operation_name: self.operation_name.clone(),
            method_name: self.method_name.clone(),
            options: self.options.clone(),
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<F> fmt::Debug for CachedFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFn")
            .field("operation_name", &self.operation_name)
            .field("method_name", &self.method_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<F> CachedFn<F> {
    /// Adds a method name to the key, for producers that are methods of some type.
    ///
    /// With a [`KeyStrategy::Custom`](super::KeyStrategy::Custom), the custom key becomes the
    /// whole key instead of its argument part.
    pub fn with_method_name(mut self, method_name: impl Into<String>) -> Self {
        self.method_name = Some(method_name.into());
        self
    }

    pub fn options(&self) -> &CachingOptions {
        &self.options
    }

    /// Derives the key a call with `args` is cached under.
    pub fn key_for<A>(&self, args: &A) -> Result<CacheKey, CacheError>
    where
        A: Serialize + ?Sized,
    {
        self.options.key_strategy.derive(
            &self.operation_name,
            self.method_name.as_deref(),
            &self.options.prefix,
            args,
        )
    }

    /// Calls the producer with `args`, or returns the cached result of an earlier call.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::KeyDerivation`] before touching the cache if `args` cannot be
    /// serialized. See [`Coalescer::execute`] for everything else.
    pub async fn call<A, T, E, Fut>(&self, args: A) -> Result<T, CacheError>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        A: Serialize + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
        E: StdError + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = self.key_for(&args)?;
        let producer = Arc::clone(&self.producer);
        self.coalescer
            .execute(key, &self.options, move || producer(args))
            .await
    }
}
