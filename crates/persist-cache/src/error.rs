use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error raised by the caching machinery itself.
///
/// Errors of the wrapped callable never end up in here, they are passed through unchanged as
/// [`CallError::Callable`].
#[derive(Debug, Error)]
pub enum CacheError {
    /// An argument could not be canonically encoded.
    ///
    /// The call is not cached. Callers may choose to invoke the function directly.
    #[error("failed to derive cache key: {0}")]
    KeyDerivation(String),
    /// A lock could not be acquired within the configured `lock_timeout`.
    ///
    /// This is never raised with the default policy, which blocks indefinitely.
    #[error("lock timeout after {0:?}")]
    LockTimeout(Duration),
    /// An underlying I/O failure, like a full disk or missing permissions.
    #[error("storage error: {0}")]
    Storage(#[from] io::Error),
    /// A result value could not be serialized for persisting.
    #[error("failed to encode cache entry: {0}")]
    Encode(String),
    /// A persisted entry could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
}

impl CacheError {
    pub(crate) fn malformed(err: impl std::fmt::Display) -> Self {
        Self::Malformed(err.to_string())
    }

    /// Whether this is a [`Storage`](Self::Storage) error of kind [`io::ErrorKind::NotFound`].
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// The error returned when invoking a cached callable.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The cache failed. Nothing was persisted.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// The wrapped callable failed. Its error is passed through unchanged and never cached.
    #[error("{0}")]
    Callable(E),
}

impl<E> CallError<E> {
    /// Returns the error of the wrapped callable, if that is what failed.
    pub fn into_callable(self) -> Option<E> {
        match self {
            Self::Callable(e) => Some(e),
            Self::Cache(_) => None,
        }
    }

    /// Returns the cache error, if the caching machinery failed.
    pub fn cache_error(&self) -> Option<&CacheError> {
        match self {
            Self::Cache(e) => Some(e),
            Self::Callable(_) => None,
        }
    }
}

/// Runs `f`, turning an [`io::ErrorKind::NotFound`] into `Ok(None)`.
///
/// Entries and whole cache directories can disappear at any time due to a concurrent flush,
/// clear or delete. Those are not errors, merely a cache miss.
pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
