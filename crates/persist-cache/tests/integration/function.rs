use std::convert::Infallible;
use std::thread;
use std::time::Duration;

use persist_cache::{CacheError, CacheHandle, Cached, CallError};
use persist_cache_test as test_support;

use crate::utils::{Calls, config, open};

#[test]
fn test_no_reexecution_on_hit() {
    test_support::setup();
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let square = Cached::function(open(cache_root.path(), "square"), "square", |(x,): (i64,)| {
        calls.hit();
        Ok::<_, Infallible>(x * x)
    });

    assert_eq!(square.call((3,)).unwrap(), 9);
    assert_eq!(square.call((3,)).unwrap(), 9);
    assert_eq!(square.call((4,)).unwrap(), 16);
    assert_eq!(calls.count(), 2);
}

#[test]
fn test_results_survive_restarts() {
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let greet = |(name,): (String,)| {
        calls.hit();
        Ok::<_, Infallible>(format!("hello {name}"))
    };

    let first = Cached::function(open(cache_root.path(), "greet"), "greet", greet);
    assert_eq!(first.call(("world".to_owned(),)).unwrap(), "hello world");
    drop(first);

    let second = Cached::function(open(cache_root.path(), "greet"), "greet", greet);
    assert_eq!(second.call(("world".to_owned(),)).unwrap(), "hello world");
    assert_eq!(calls.count(), 1);
}

#[test]
fn test_errors_are_not_cached() {
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let flaky = Cached::function(open(cache_root.path(), "flaky"), "flaky", |(): ()| {
        calls.hit();
        match calls.count() {
            1 => Err("first attempt fails"),
            n => Ok(n),
        }
    });

    let err = flaky.call(()).unwrap_err();
    assert!(matches!(err, CallError::Callable("first attempt fails")));
    assert!(flaky.handle().store().list_keys().unwrap().is_empty());

    assert_eq!(flaky.call(()).unwrap(), 2);
    assert_eq!(flaky.call(()).unwrap(), 2);
    assert_eq!(calls.count(), 2);
}

#[test]
fn test_keys_are_type_sensitive() {
    let cache_root = test_support::tempdir();
    let handle = open(cache_root.path(), "describe");
    let calls = Calls::default();

    // both share one identity, so only the argument types tell them apart
    let integer = Cached::function(handle.clone(), "describe", |(x,): (i64,)| {
        calls.hit();
        Ok::<_, Infallible>(format!("integer {x}"))
    });
    let float = Cached::function(handle, "describe", |(x,): (f64,)| {
        calls.hit();
        Ok::<_, Infallible>(format!("float {x:.1}"))
    });

    assert_eq!(integer.call((5,)).unwrap(), "integer 5");
    assert_eq!(float.call((5.0,)).unwrap(), "float 5.0");
    assert_eq!(integer.call((5,)).unwrap(), "integer 5");
    assert_eq!(calls.count(), 2);
}

#[test]
fn test_expiry() {
    let unit = Duration::from_millis(500);
    let cache_root = test_support::tempdir();
    let handle = CacheHandle::open(&config(cache_root.path(), Some(2 * unit)), "expiry").unwrap();
    let calls = Calls::default();
    let square = Cached::function(handle, "square", |(x,): (u64,)| {
        calls.hit();
        Ok::<_, Infallible>(x * x)
    });

    assert_eq!(square.call((3,)).unwrap(), 9);
    thread::sleep(unit);
    assert_eq!(square.call((3,)).unwrap(), 9);
    assert_eq!(calls.count(), 1);

    thread::sleep(2 * unit);
    assert_eq!(square.call((3,)).unwrap(), 9);
    assert_eq!(calls.count(), 2);
}

#[test]
fn test_unwritable_cache() {
    let cache_root = test_support::tempdir();
    let handle = open(cache_root.path(), "unwritable");
    std::fs::remove_dir_all(handle.dir()).unwrap();
    std::fs::write(handle.dir(), b"in the way").unwrap();

    let calls = Calls::default();
    let cached = Cached::function(handle, "unwritable", |(): ()| {
        calls.hit();
        Ok::<_, Infallible>(1)
    });

    let err = cached.call(()).unwrap_err();
    assert!(matches!(err.cache_error(), Some(CacheError::Storage(_))));
    assert_eq!(calls.count(), 1);
}
