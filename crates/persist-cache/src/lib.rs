//! Persistent memoization of function calls.
//!
//! Results of cached calls are stored on the local filesystem and survive process restarts.
//! Repeated calls with equal arguments return the stored result until it outlives the
//! configured expiry of its cache. Plain functions, async functions, iterators and streams
//! can all be cached, see [`Cached`].
//!
//! ```no_run
//! use std::convert::Infallible;
//!
//! use persist_cache::{CacheHandle, Cached, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let handle = CacheHandle::open(&config, "square")?;
//! let square = Cached::function(handle, "square", |(x,): (i64,)| Ok::<_, Infallible>(x * x));
//!
//! assert_eq!(square.call((4,))?, 16);
//! # Ok(())
//! # }
//! ```
//!
//! # On-disk layout
//!
//! ```text
//! <cache_dir>/
//!   <cache>/          xxh3-64 of the cache name as 16 lowercase hex digits,
//!                     followed by the decimal byte length of the name
//!     .cache.lock     structural lock of the cache
//!     <key>.entry     zstd-compressed bincode payload, modified time = creation time
//!     <key>.lock      data lock of the entry
//!     .tmp*           writes in flight, never read
//! ```
//!
//! `<key>` is the xxh3-128 hash of the canonical encoding of the call as 32 lowercase hex
//! digits, followed by the decimal length of that encoding.
//!
//! Lock files of removed entries are kept, only [`delete`] removes them.

use std::time::Duration;

mod adapter;
mod codec;
mod config;
mod error;
mod expiry;
mod handle;
mod key;
mod lock;
pub mod logging;
mod store;

pub use adapter::{
    AsyncFunction, AsyncGenerator, Cached, CachedIter, Callable, CallableKind, Function,
    Generator,
};
pub use codec::{
    SequenceDecoder, SequenceEncoder, decode_sequence, decode_value, encode_sequence,
    encode_value,
};
pub use config::{Config, LogFormat, Logging};
pub use error::{CacheError, CacheResult, CallError};
pub use expiry::{FlushStats, is_expired};
pub use handle::CacheHandle;
pub use key::{
    CacheArgs, CallArgs, EncodeError, EntryKey, KeyDeriver, ParseEntryKeyError, Signature,
    cache_dir_name, derive_key, to_canonical_bytes,
};
pub use lock::{FileLock, LockManager};
pub use store::{Entry, EntryInfo, Examined, Store};

/// The cache a management operation applies to.
#[derive(Debug, Clone)]
pub enum CacheTarget<'a> {
    /// An already opened cache.
    Handle(&'a CacheHandle),
    /// A cache called by name, resolved within the configured `cache_dir`.
    Named(&'a Config, &'a str),
}

impl CacheTarget<'_> {
    fn resolve(self) -> CacheHandle {
        match self {
            Self::Handle(handle) => handle.clone(),
            Self::Named(config, name) => CacheHandle::resolve(config, name),
        }
    }
}

impl<'a> From<&'a CacheHandle> for CacheTarget<'a> {
    fn from(handle: &'a CacheHandle) -> Self {
        Self::Handle(handle)
    }
}

impl<'a, C: Callable> From<&'a Cached<C>> for CacheTarget<'a> {
    fn from(cached: &'a Cached<C>) -> Self {
        Self::Handle(cached.handle())
    }
}

impl<'a> From<(&'a Config, &'a str)> for CacheTarget<'a> {
    fn from((config, name): (&'a Config, &'a str)) -> Self {
        Self::Named(config, name)
    }
}

/// Removes all entries of `target` that outlived `expiry`, or its configured expiry.
///
/// A cache resolved by name uses the expiry of the given [`Config`].
pub fn flush<'a>(
    target: impl Into<CacheTarget<'a>>,
    expiry: Option<Duration>,
) -> CacheResult<FlushStats> {
    target.into().resolve().flush(expiry)
}

/// Removes all entries of `target`.
pub fn clear<'a>(target: impl Into<CacheTarget<'a>>) -> CacheResult<FlushStats> {
    target.into().resolve().clear()
}

/// Removes `target` entirely, including its directory and lock files.
///
/// Deleting a cache that does not exist is not an error.
pub fn delete<'a>(target: impl Into<CacheTarget<'a>>) -> CacheResult<()> {
    target.into().resolve().delete()
}
