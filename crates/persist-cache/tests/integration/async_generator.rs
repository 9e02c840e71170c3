use std::convert::Infallible;

use futures::{StreamExt, TryStreamExt, stream};
use persist_cache::{Cached, CallError, CallableKind};
use persist_cache_test as test_support;

use crate::utils::{Calls, open};

#[tokio::test]
async fn test_async_generator_replay() {
    test_support::setup();
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let squares = Cached::async_generator(
        open(cache_root.path(), "squares"),
        "squares",
        |(n,): (u32,)| {
            calls.hit();
            stream::iter(1..=n).then(|i| async move {
                tokio::task::yield_now().await;
                Ok::<_, Infallible>(i * i)
            })
        },
    );
    assert_eq!(squares.kind(), CallableKind::AsyncGenerator);

    let first: Vec<u32> = squares.call((4,)).await.unwrap().try_collect().await.unwrap();
    let replayed: Vec<u32> = squares.call((4,)).await.unwrap().try_collect().await.unwrap();
    assert_eq!(first, [1, 4, 9, 16]);
    assert_eq!(replayed, first);
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_async_generator_all_or_nothing() {
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let lines = Cached::async_generator(open(cache_root.path(), "lines"), "lines", |(): ()| {
        calls.hit();
        stream::iter([Ok("one".to_owned()), Ok("two".to_owned()), Err(404_u16)])
    });

    for _ in 0..2 {
        let items: Vec<_> = lines.call(()).await.unwrap().collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().ok().map(String::as_str), Some("one"));
        assert_eq!(items[1].as_ref().ok().map(String::as_str), Some("two"));
        assert!(matches!(items[2], Err(CallError::Callable(404))));
    }
    assert_eq!(calls.count(), 2);
    assert!(lines.handle().store().list_keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_async_generator_early_abandon() {
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let naturals = Cached::async_generator(
        open(cache_root.path(), "naturals"),
        "naturals",
        |(n,): (u64,)| {
            calls.hit();
            stream::iter((0..n).map(Ok::<_, Infallible>))
        },
    );

    let prefix: Vec<u64> = naturals
        .call((100,))
        .await
        .unwrap()
        .take(3)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(prefix, [0, 1, 2]);
    assert!(naturals.handle().store().list_keys().unwrap().is_empty());

    let all: Vec<u64> = naturals.call((100,)).await.unwrap().try_collect().await.unwrap();
    assert_eq!(all.len(), 100);
    assert_eq!(naturals.handle().store().list_keys().unwrap().len(), 1);
    assert_eq!(calls.count(), 2);
}
