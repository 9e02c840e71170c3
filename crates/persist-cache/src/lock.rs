//! Advisory file locks guarding cache entries and whole caches.
//!
//! There are two lock scopes:
//!
//! - the *data lock* of a single entry, held while that entry is read, written or removed,
//! - the *structural lock* of a cache, held while the cache is flushed, cleared or deleted.
//!
//! Structural operations take the structural lock first and then take and release the data
//! lock of each entry in turn. Locks are not re-entrant.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{CacheError, CacheResult};
use crate::handle::CacheHandle;
use crate::key::EntryKey;

/// Contention longer than this is logged.
const CONTENTION_WARNING: Duration = Duration::from_millis(500);

/// Interval at which a lock with a timeout is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An exclusive advisory lock on a lock file.
///
/// The lock is released when this guard is dropped. Every acquisition opens its own file
/// description, so the lock excludes other threads of this process as well as other
/// processes.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    /// Acquires the lock on the file at `path`, creating it if necessary.
    ///
    /// Without a `timeout` this blocks until the lock becomes available. With a timeout, this
    /// fails with [`CacheError::LockTimeout`] once it elapsed.
    pub fn acquire(path: impl Into<PathBuf>, timeout: Option<Duration>) -> CacheResult<Self> {
        let path = path.into();

        let file = match sys::try_lock(&path)? {
            Some(file) => file,
            None => {
                let start = Instant::now();
                let file = match timeout {
                    Some(timeout) => Self::poll(&path, start, timeout)?,
                    None => sys::lock(&path)?,
                };
                let waited = start.elapsed();
                if waited > CONTENTION_WARNING {
                    tracing::warn!(
                        path = %path.display(),
                        waited = ?waited,
                        "acquired cache lock after contention"
                    );
                }
                file
            }
        };

        Ok(Self { path, file })
    }

    fn poll(path: &Path, start: Instant, timeout: Duration) -> CacheResult<File> {
        let mut warned = false;
        loop {
            if let Some(file) = sys::try_lock(path)? {
                return Ok(file);
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(CacheError::LockTimeout(timeout));
            }
            if !warned && waited > CONTENTION_WARNING {
                tracing::warn!(path = %path.display(), "waiting for contended cache lock");
                warned = true;
            }

            std::thread::sleep(POLL_INTERVAL.min(timeout - waited));
        }
    }

    /// The path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        sys::unlock(self);
    }
}

#[cfg(unix)]
mod sys {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    use super::*;

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
    }

    fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
        // SAFETY: the descriptor is owned by `file` and stays open for the duration of the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Tries to take the lock without blocking, returning `None` if it is held elsewhere.
    pub fn try_lock(path: &Path) -> io::Result<Option<File>> {
        let file = open(path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Blocks until the lock is taken.
    pub fn lock(path: &Path) -> io::Result<File> {
        let file = open(path)?;
        loop {
            match flock(&file, libc::LOCK_EX) {
                Ok(()) => return Ok(file),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn unlock(lock: &FileLock) {
        // closing the file releases the lock as well, this just makes it explicit
        if let Err(err) = flock(&lock.file, libc::LOCK_UN) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                path = %lock.path.display(),
                "failed to release cache lock"
            );
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::TryLockError;

    use super::*;

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    /// Tries to take the lock without blocking, returning `None` if it is held elsewhere.
    pub fn try_lock(path: &Path) -> io::Result<Option<File>> {
        let file = open(path)?;
        match file.try_lock() {
            Ok(()) => Ok(Some(file)),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(e)) => Err(e),
        }
    }

    /// Blocks until the lock is taken.
    pub fn lock(path: &Path) -> io::Result<File> {
        let file = open(path)?;
        file.lock()?;
        Ok(file)
    }

    pub fn unlock(lock: &FileLock) {
        // closing the file releases the lock as well, this just makes it explicit
        if let Err(err) = lock.file.unlock() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                path = %lock.path.display(),
                "failed to release cache lock"
            );
        }
    }
}

/// Names the lock scopes of a cache.
#[derive(Debug)]
pub struct LockManager;

impl LockManager {
    /// Acquires the data lock of the entry with `key`.
    pub fn data_lock(handle: &CacheHandle, key: &EntryKey) -> CacheResult<FileLock> {
        FileLock::acquire(handle.lock_path(key), handle.lock_timeout())
    }

    /// Acquires the structural lock of the whole cache.
    pub fn structural_lock(handle: &CacheHandle) -> CacheResult<FileLock> {
        FileLock::acquire(handle.structural_lock_path(), handle.lock_timeout())
    }

    /// Like [`data_lock`](Self::data_lock), but returns `None` if the cache directory is gone.
    pub fn try_data_lock(handle: &CacheHandle, key: &EntryKey) -> CacheResult<Option<FileLock>> {
        absent_if_not_found(Self::data_lock(handle, key))
    }

    /// Like [`structural_lock`](Self::structural_lock), but returns `None` if the cache
    /// directory is gone.
    pub fn try_structural_lock(handle: &CacheHandle) -> CacheResult<Option<FileLock>> {
        absent_if_not_found(Self::structural_lock(handle))
    }
}

fn absent_if_not_found(result: CacheResult<FileLock>) -> CacheResult<Option<FileLock>> {
    match result {
        Ok(lock) => Ok(Some(lock)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
