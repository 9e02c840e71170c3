//! Expiry of cache entries, and the structural operations on whole caches.

use std::fs;
use std::time::{Duration, SystemTime};

use crate::error::{CacheResult, catch_not_found};
use crate::handle::CacheHandle;
use crate::lock::LockManager;
use crate::store::Examined;

/// Temporary files older than this are considered abandoned by a crashed writer.
const STALE_TEMP_FILE_AGE: Duration = Duration::from_secs(3600);

/// Whether an entry created at `created_at` has outlived `expiry` at time `now`.
///
/// An entry created in the future has an age of zero. With no `expiry`, nothing ever expires.
pub fn is_expired(created_at: SystemTime, expiry: Option<Duration>, now: SystemTime) -> bool {
    match expiry {
        Some(expiry) => now.duration_since(created_at).unwrap_or_default() > expiry,
        None => false,
    }
}

/// Statistics of a sweep over all entries of a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl CacheHandle {
    /// Removes every entry that outlived `expiry`, or the configured expiry of this cache.
    ///
    /// If neither is set, this does nothing.
    pub fn flush(&self, expiry: Option<Duration>) -> CacheResult<FlushStats> {
        let Some(expiry) = expiry.or_else(|| self.expiry()) else {
            return Ok(FlushStats::default());
        };

        let now = SystemTime::now();
        self.sweep("flush", |created_at| {
            is_expired(created_at, Some(expiry), now)
        })
    }

    /// Removes all entries.
    pub fn clear(&self) -> CacheResult<FlushStats> {
        self.sweep("clear", |_| true)
    }

    /// Removes all entries, all lock files and the cache directory itself.
    ///
    /// Deleting a cache that does not exist is not an error.
    pub fn delete(&self) -> CacheResult<()> {
        let Some(_lock) = LockManager::try_structural_lock(self)? else {
            return Ok(());
        };

        let store = self.store();
        for key in store.list_keys()? {
            store.remove(&key)?;
        }

        catch_not_found(|| fs::remove_dir_all(self.dir()))?;
        tracing::info!(cache = self.name(), "deleted cache");
        Ok(())
    }

    /// Removes every entry for which `predicate` holds for its creation time.
    ///
    /// Entries are examined one at a time under their data lock, while the structural lock
    /// is held for the whole sweep. Failures on individual entries are logged and skipped.
    fn sweep(
        &self,
        operation: &str,
        predicate: impl Fn(SystemTime) -> bool,
    ) -> CacheResult<FlushStats> {
        let Some(_lock) = LockManager::try_structural_lock(self)? else {
            return Ok(FlushStats::default());
        };

        let store = self.store();
        let mut stats = FlushStats::default();
        for key in store.list_keys()? {
            match store.remove_if(&key, &predicate) {
                Ok(Examined::Removed(size)) => {
                    stats.removed_files += 1;
                    stats.removed_bytes += size;
                }
                Ok(Examined::Retained(size)) => {
                    stats.retained_files += 1;
                    stats.retained_bytes += size;
                }
                Ok(Examined::Missing) => {}
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        cache = self.name(),
                        %key,
                        "failed to {operation} cache entry"
                    );
                }
            }
        }

        if let Err(err) = store.sweep_temp_files(STALE_TEMP_FILE_AGE) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                cache = self.name(),
                "failed to remove stale temporary files"
            );
        }

        if stats.removed_files > 0 {
            tracing::info!(
                cache = self.name(),
                "{operation}: removed {} files, totaling {} bytes; retained {} files, totaling {} bytes",
                stats.removed_files,
                stats.removed_bytes,
                stats.retained_files,
                stats.retained_bytes,
            );
        }
        Ok(stats)
    }
}
