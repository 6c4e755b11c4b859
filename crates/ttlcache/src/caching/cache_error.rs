use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use crate::storage::StorageError;

/// An error returned by the cache.
///
/// This is [`Clone`] so that a single outcome of a computation can be handed to every caller
/// waiting on it. A cache miss is never an error.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The storage backend failed.
    ///
    /// The backend error is passed through unchanged and the operation is not retried.
    #[error("cache storage failed")]
    Storage(#[source] Arc<StorageError>),
    /// The content to be cached could not be serialized.
    #[error("failed to serialize cache content")]
    Serialize(#[source] Arc<serde_json::Error>),
    /// The cached content does not have the requested shape.
    #[error("failed to deserialize cache content")]
    Deserialize(#[source] Arc<serde_json::Error>),
    /// The call arguments could not be turned into a cache key.
    #[error("failed to derive cache key")]
    KeyDerivation(#[source] Arc<serde_json::Error>),
    /// The wrapped computation failed.
    ///
    /// The original error can be recovered with [`CacheError::computation_error`].
    #[error("cache computation failed")]
    Computation(#[source] Arc<dyn StdError + Send + Sync>),
    /// The computation task went away without producing a result.
    #[error("cache computation was cancelled")]
    Cancelled,
}

impl From<StorageError> for CacheError {
    fn from(err: StorageError) -> Self {
        let dynerr: &dyn StdError = &err; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "Cache storage failed");
        Self::Storage(Arc::new(err))
    }
}

impl CacheError {
    /// Wraps the error of a failed computation.
    pub fn computation<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Computation(Arc::new(err))
    }

    pub(crate) fn serialize(err: serde_json::Error) -> Self {
        Self::Serialize(Arc::new(err))
    }

    pub(crate) fn deserialize(err: serde_json::Error) -> Self {
        Self::Deserialize(Arc::new(err))
    }

    pub(crate) fn key_derivation(err: serde_json::Error) -> Self {
        Self::KeyDerivation(Arc::new(err))
    }

    /// Returns the error of the wrapped computation if it is of type `E`.
    pub fn computation_error<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            Self::Computation(err) => {
                let err: &(dyn StdError + 'static) = err.as_ref();
                err.downcast_ref()
            }
            _ => None,
        }
    }

    /// Returns the storage error, if the storage backend failed.
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}
