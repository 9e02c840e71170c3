use std::convert::Infallible;
use std::time::Duration;

use futures::future::join_all;
use persist_cache::{Cached, CallError, CallableKind};
use persist_cache_test as test_support;

use crate::utils::{Calls, open};

#[tokio::test]
async fn test_async_no_reexecution_on_hit() {
    test_support::setup();
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let fetch = Cached::async_function(
        open(cache_root.path(), "fetch"),
        "fetch",
        |(id, verbose): (u32, bool)| {
            calls.hit();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, Infallible>(if verbose {
                    format!("resource #{id}")
                } else {
                    id.to_string()
                })
            }
        },
    );
    assert_eq!(fetch.kind(), CallableKind::AsyncFunction);

    assert_eq!(fetch.call((7, true)).await.unwrap(), "resource #7");
    assert_eq!(fetch.call((7, false)).await.unwrap(), "7");
    assert_eq!(fetch.call((7, true)).await.unwrap(), "resource #7");
    assert_eq!(calls.count(), 2);
}

#[tokio::test]
async fn test_async_errors_are_not_cached() {
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let failing = Cached::async_function(open(cache_root.path(), "failing"), "failing", |(): ()| {
        calls.hit();
        async { Err::<u8, _>(std::io::Error::other("unreachable host")) }
    });

    for _ in 0..2 {
        let err = failing.call(()).await.unwrap_err();
        let CallError::Callable(err) = err else {
            panic!("expected the error of the callable");
        };
        assert_eq!(err.to_string(), "unreachable host");
    }
    assert_eq!(calls.count(), 2);
    assert!(failing.handle().store().list_keys().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_concurrent_calls() {
    let cache_root = test_support::tempdir();
    let double = Cached::async_function(
        open(cache_root.path(), "double"),
        "double",
        |(x,): (u64,)| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, Infallible>(vec![x; 2])
        },
    );

    // concurrent misses may all execute, but every caller sees a complete result
    let results = join_all((0..16).map(|i| double.call((i % 4,)))).await;
    for (i, result) in results.into_iter().enumerate() {
        let x = (i % 4) as u64;
        assert_eq!(result.unwrap(), [x, x]);
    }

    assert_eq!(double.handle().store().list_keys().unwrap().len(), 4);
    assert_eq!(double.call((3,)).await.unwrap(), [3, 3]);
}
