use std::convert::Infallible;
use std::thread;
use std::time::Duration;

use persist_cache::{CacheHandle, Cached, FlushStats};
use persist_cache_test as test_support;

use crate::utils::{Calls, config, open};

#[test]
fn test_set_expiry() {
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let cached = Cached::function(open(cache_root.path(), "expiring"), "id", |(x,): (u8,)| {
        calls.hit();
        Ok::<_, Infallible>(x)
    });

    cached.call((1,)).unwrap();
    cached.call((2,)).unwrap();
    thread::sleep(Duration::from_millis(50));

    // existing entries are judged by the new expiry
    cached.set_expiry(Some(Duration::from_millis(10)));
    assert_eq!(cached.handle().expiry(), Some(Duration::from_millis(10)));
    cached.call((1,)).unwrap();
    assert_eq!(calls.count(), 3);

    let stats = cached.flush().unwrap();
    assert_eq!(stats.removed_files, 1);
    assert_eq!(stats.retained_files, 1);

    cached.set_expiry(None);
    assert_eq!(cached.flush().unwrap(), FlushStats::default());
}

#[test]
fn test_clear_and_delete() {
    test_support::setup();
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let cached = Cached::function(open(cache_root.path(), "lifecycle"), "inc", |(x,): (i32,)| {
        calls.hit();
        Ok::<_, Infallible>(x + 1)
    });

    for x in 0..3 {
        cached.call((x,)).unwrap();
    }
    assert_eq!(cached.clear().unwrap().removed_files, 3);
    assert!(cached.handle().dir().is_dir());

    cached.call((0,)).unwrap();
    assert_eq!(calls.count(), 4);

    cached.delete().unwrap();
    assert!(!cached.handle().dir().exists());
    cached.delete().unwrap();

    // the directory is recreated by the next write
    assert_eq!(cached.call((0,)).unwrap(), 1);
    assert_eq!(calls.count(), 5);
    assert_eq!(cached.handle().store().list_keys().unwrap().len(), 1);
}

#[test]
fn test_free_functions_by_name() {
    let cache_root = test_support::tempdir();
    let config = config(cache_root.path(), None);

    let handle = CacheHandle::open(&config, "by-name").unwrap();
    let cached = Cached::function(handle.clone(), "len", |(s,): (String,)| {
        Ok::<_, Infallible>(s.len())
    });
    for word in ["a", "bb", "ccc"] {
        cached.call((word.to_owned(),)).unwrap();
    }

    // the configuration has no expiry, so only an explicit one removes anything
    assert_eq!(persist_cache::flush((&config, "by-name"), None).unwrap(), FlushStats::default());
    thread::sleep(Duration::from_millis(20));
    let stats =
        persist_cache::flush((&config, "by-name"), Some(Duration::from_millis(10))).unwrap();
    assert_eq!(stats.removed_files, 3);

    cached.call(("dddd".to_owned(),)).unwrap();
    assert_eq!(persist_cache::clear(&cached).unwrap().removed_files, 1);

    cached.call(("eeeee".to_owned(),)).unwrap();
    persist_cache::delete((&config, "by-name")).unwrap();
    assert!(!handle.dir().exists());
    persist_cache::delete(&handle).unwrap();
}

#[test]
fn test_management_of_unknown_cache() {
    let cache_root = test_support::tempdir();
    let config = config(cache_root.path(), Some(Duration::from_secs(1)));

    assert_eq!(persist_cache::flush((&config, "unknown"), None).unwrap(), FlushStats::default());
    assert_eq!(persist_cache::clear((&config, "unknown")).unwrap(), FlushStats::default());
    persist_cache::delete((&config, "unknown")).unwrap();

    // resolving a cache by name for management never creates it
    assert!(!config.cache_dir_for("unknown").exists());
}
