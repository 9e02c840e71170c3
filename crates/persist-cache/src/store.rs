//! The on-disk entry store.
//!
//! Every entry lives in its own file named after its [`EntryKey`]. The file's modification
//! time is the creation time of the entry. Entries are written to a temporary file in the
//! cache directory first and atomically renamed into place, so readers never observe a
//! partial entry.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

use filetime::FileTime;

use crate::error::{CacheResult, catch_not_found};
use crate::expiry::is_expired;
use crate::handle::{CacheHandle, ENTRY_EXTENSION, TEMP_PREFIX};
use crate::key::EntryKey;
use crate::lock::LockManager;

/// A cache entry read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: EntryKey,
    pub payload: Vec<u8>,
    pub created_at: SystemTime,
}

/// Metadata about an entry, without its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: EntryKey,
    /// The size of the encoded payload in bytes.
    pub size: u64,
    pub created_at: SystemTime,
}

/// The outcome of [`Store::remove_if`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Examined {
    /// The entry was removed, freeing the given number of bytes.
    Removed(u64),
    /// The entry was kept, it occupies the given number of bytes.
    Retained(u64),
    /// There was no such entry.
    Missing,
}

/// Reads and writes the entries of one cache.
#[derive(Debug, Clone)]
pub struct Store {
    handle: CacheHandle,
}

impl Store {
    pub fn new(handle: CacheHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &CacheHandle {
        &self.handle
    }

    /// Reads the entry with `key`.
    ///
    /// Returns `None` if there is no such entry, or if it outlived the configured expiry of
    /// the cache. Expired entries are removed.
    pub fn get(&self, key: &EntryKey) -> CacheResult<Option<Entry>> {
        let path = self.handle.entry_path(key);
        if !path.is_file() {
            tracing::trace!(cache = self.handle.name(), %key, "cache miss");
            return Ok(None);
        }

        let Some(_lock) = LockManager::try_data_lock(&self.handle, key)? else {
            return Ok(None);
        };

        let Some(metadata) = catch_not_found(|| fs::metadata(&path))? else {
            return Ok(None);
        };
        let created_at = metadata.modified()?;

        if is_expired(created_at, self.handle.expiry(), SystemTime::now()) {
            tracing::debug!(cache = self.handle.name(), %key, "removing expired entry");
            catch_not_found(|| fs::remove_file(&path))?;
            return Ok(None);
        }

        let Some(payload) = catch_not_found(|| fs::read(&path))? else {
            return Ok(None);
        };

        tracing::trace!(cache = self.handle.name(), %key, "cache hit");
        Ok(Some(Entry {
            key: *key,
            payload,
            created_at,
        }))
    }

    /// Writes the entry with `key`, replacing any existing entry.
    ///
    /// The entry is stamped with `created_at` as its creation time.
    pub fn put(&self, key: &EntryKey, payload: &[u8], created_at: SystemTime) -> CacheResult<()> {
        let dir = self.handle.dir();
        fs::create_dir_all(dir)?;

        // the temporary file only ever exists while the data lock is held
        let _lock = LockManager::data_lock(&self.handle, key)?;
        let mut temp_file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)?;
        temp_file.write_all(payload)?;
        temp_file.as_file().sync_all()?;

        let path = self.handle.entry_path(key);
        temp_file.persist(&path).map_err(|e| e.error)?;
        filetime::set_file_mtime(&path, FileTime::from_system_time(created_at))?;

        tracing::debug!(
            cache = self.handle.name(),
            %key,
            size = payload.len(),
            "stored cache entry"
        );
        Ok(())
    }

    /// Removes the entry with `key`, returning whether there was one.
    pub fn remove(&self, key: &EntryKey) -> CacheResult<bool> {
        let Some(_lock) = LockManager::try_data_lock(&self.handle, key)? else {
            return Ok(false);
        };
        let removed = catch_not_found(|| fs::remove_file(self.handle.entry_path(key)))?.is_some();
        if removed {
            tracing::debug!(cache = self.handle.name(), %key, "removed cache entry");
        }
        Ok(removed)
    }

    /// Removes the entry with `key` if `predicate` holds for its creation time.
    ///
    /// The entry is examined and removed under its data lock.
    pub fn remove_if(
        &self,
        key: &EntryKey,
        predicate: impl FnOnce(SystemTime) -> bool,
    ) -> CacheResult<Examined> {
        let Some(_lock) = LockManager::try_data_lock(&self.handle, key)? else {
            return Ok(Examined::Missing);
        };

        let path = self.handle.entry_path(key);
        let Some(metadata) = catch_not_found(|| fs::metadata(&path))? else {
            return Ok(Examined::Missing);
        };
        let size = metadata.len();

        if !predicate(metadata.modified()?) {
            return Ok(Examined::Retained(size));
        }

        tracing::debug!(cache = self.handle.name(), %key, "removing cache entry");
        Ok(match catch_not_found(|| fs::remove_file(&path))? {
            Some(()) => Examined::Removed(size),
            None => Examined::Missing,
        })
    }

    /// Lists the keys of all entries, in ascending order.
    ///
    /// A cache whose directory does not exist has no entries. Files that are not entries
    /// are ignored.
    pub fn list_keys(&self) -> CacheResult<Vec<EntryKey>> {
        let Some(read_dir) = catch_not_found(|| fs::read_dir(self.handle.dir()))? else {
            return Ok(Vec::new());
        };

        let mut keys = Vec::new();
        for dir_entry in read_dir {
            let path = dir_entry?.path();
            if let Some(key) = parse_entry_path(&path) {
                keys.push(key);
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    /// Lists all entries together with their size and creation time.
    ///
    /// Entries are not locked, so the result is only a snapshot.
    pub fn entries(&self) -> CacheResult<Vec<EntryInfo>> {
        let mut entries = Vec::new();
        for key in self.list_keys()? {
            let path = self.handle.entry_path(&key);
            if let Some(metadata) = catch_not_found(|| fs::metadata(&path))? {
                entries.push(EntryInfo {
                    key,
                    size: metadata.len(),
                    created_at: metadata.modified()?,
                });
            }
        }
        Ok(entries)
    }

    /// Removes temporary files last modified longer than `older_than` ago.
    ///
    /// These are left behind by writers that crashed before renaming them into place.
    /// Returns the number of removed files.
    pub fn sweep_temp_files(&self, older_than: Duration) -> CacheResult<usize> {
        let Some(read_dir) = catch_not_found(|| fs::read_dir(self.handle.dir()))? else {
            return Ok(0);
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for dir_entry in read_dir {
            let dir_entry = dir_entry?;
            let is_temp = dir_entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if !is_temp {
                continue;
            }

            let path = dir_entry.path();
            let Some(metadata) = catch_not_found(|| fs::metadata(&path))? else {
                continue;
            };
            if !is_expired(metadata.modified()?, Some(older_than), now) {
                continue;
            }

            tracing::debug!(path = %path.display(), "removing stale temporary file");
            if catch_not_found(|| fs::remove_file(&path))?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Parses the key of an entry file, returning `None` for any other file.
fn parse_entry_path(path: &Path) -> Option<EntryKey> {
    if path.extension()? != ENTRY_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}
