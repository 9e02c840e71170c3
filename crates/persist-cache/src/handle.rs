use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::config::Config;
use crate::error::CacheResult;
use crate::key::EntryKey;
use crate::store::Store;

/// File extension of cache entries.
pub(crate) const ENTRY_EXTENSION: &str = "entry";
/// File extension of the data lock files of cache entries.
pub(crate) const LOCK_EXTENSION: &str = "lock";
/// File name of the structural lock of a cache.
pub(crate) const STRUCTURAL_LOCK: &str = ".cache.lock";
/// File name prefix of in-flight writes.
pub(crate) const TEMP_PREFIX: &str = ".tmp";

/// A named cache backed by a directory.
///
/// The handle is cheap to clone, all clones share the same configured expiry.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    /// The logical name of this cache, used for logging.
    name: String,

    /// The directory holding all entries and lock files.
    dir: PathBuf,

    /// The shelf life of entries, `None` means they never expire.
    expiry: RwLock<Option<Duration>>,

    lock_timeout: Option<Duration>,

    compression_level: i32,
}

impl CacheHandle {
    /// Opens the cache called `name` within the configured `cache_dir`.
    ///
    /// This creates the cache directory if needed and flushes entries that outlived the
    /// configured expiry. No entries are loaded.
    pub fn open(config: &Config, name: &str) -> CacheResult<Self> {
        Self::open_dir(config, name, config.cache_dir_for(name))
    }

    /// Opens a cache stored in the explicitly given directory.
    pub fn open_dir(config: &Config, name: &str, dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let handle = Self::new(config, name, dir.into());
        fs::create_dir_all(handle.dir())?;
        tracing::debug!(
            cache = handle.name(),
            dir = %handle.dir().display(),
            "opened cache"
        );

        handle.flush(None)?;
        Ok(handle)
    }

    /// Resolves the cache called `name` without touching the filesystem.
    ///
    /// This is meant for management operations on caches that may or may not exist.
    pub fn resolve(config: &Config, name: &str) -> Self {
        Self::new(config, name, config.cache_dir_for(name))
    }

    /// Like [`resolve`](Self::resolve), for a cache stored in an explicitly given directory.
    pub fn resolve_dir(config: &Config, name: &str, dir: impl Into<PathBuf>) -> Self {
        Self::new(config, name, dir.into())
    }

    fn new(config: &Config, name: &str, dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name: name.to_owned(),
                dir,
                expiry: RwLock::new(config.expiry),
                lock_timeout: config.lock_timeout,
                compression_level: config.compression_level,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// The currently configured shelf life of entries.
    pub fn expiry(&self) -> Option<Duration> {
        *self
            .inner
            .expiry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes the shelf life of entries.
    ///
    /// This applies to all future reads and flushes. Existing entries are not re-stamped.
    pub fn set_expiry(&self, expiry: Option<Duration>) {
        *self
            .inner
            .expiry
            .write()
            .unwrap_or_else(PoisonError::into_inner) = expiry;
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.inner.lock_timeout
    }

    pub fn compression_level(&self) -> i32 {
        self.inner.compression_level
    }

    /// The entry store of this cache.
    pub fn store(&self) -> Store {
        Store::new(self.clone())
    }

    pub(crate) fn entry_path(&self, key: &EntryKey) -> PathBuf {
        self.dir().join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    pub(crate) fn lock_path(&self, key: &EntryKey) -> PathBuf {
        self.dir().join(format!("{key}.{LOCK_EXTENSION}"))
    }

    pub(crate) fn structural_lock_path(&self) -> PathBuf {
        self.dir().join(STRUCTURAL_LOCK)
    }
}
