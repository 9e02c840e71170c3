use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use persist_cache::{CacheHandle, Config};

/// A configuration keeping all caches below `root`.
pub fn config(root: &Path, expiry: Option<Duration>) -> Config {
    Config {
        cache_dir: root.to_owned(),
        expiry,
        ..Default::default()
    }
}

pub fn open(root: &Path, name: &str) -> CacheHandle {
    CacheHandle::open(&config(root, None), name).unwrap()
}

/// Counts how often a wrapped callable actually ran.
#[derive(Debug, Default)]
pub struct Calls(AtomicUsize);

impl Calls {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
