use std::convert::Infallible;

use persist_cache::{Cached, CallError, CallableKind};
use persist_cache_test as test_support;
use serde::{Deserialize, Serialize};

use crate::utils::{Calls, open};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Token {
    text: String,
    offset: usize,
}

#[test]
fn test_generator_all_or_nothing() {
    test_support::setup();
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let counting = Cached::generator(
        open(cache_root.path(), "counting"),
        "counting",
        |(fail,): (bool,)| {
            calls.hit();
            (1..=3).map(Ok).chain(fail.then_some(Err("boom")))
        },
    );
    assert_eq!(counting.kind(), CallableKind::Generator);

    // every element is delivered before the failure, but nothing is cached
    let items: Vec<_> = counting.call((true,)).unwrap().collect();
    assert_eq!(items.len(), 4);
    assert!(items[..3].iter().map(|item| item.as_ref().ok()).eq([Some(&1), Some(&2), Some(&3)]));
    assert!(matches!(items[3], Err(CallError::Callable("boom"))));
    assert!(counting.handle().store().list_keys().unwrap().is_empty());

    let items: Vec<_> = counting.call((true,)).unwrap().collect();
    assert_eq!(items.len(), 4);
    assert_eq!(calls.count(), 2);

    // a generator that completes is captured exactly
    let first: Vec<i32> = counting.call((false,)).unwrap().map(Result::unwrap).collect();
    let replayed: Vec<i32> = counting.call((false,)).unwrap().map(Result::unwrap).collect();
    assert_eq!(first, [1, 2, 3]);
    assert_eq!(replayed, [1, 2, 3]);
    assert_eq!(calls.count(), 3);
}

#[test]
fn test_generator_early_abandon() {
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let naturals = Cached::generator(
        open(cache_root.path(), "naturals"),
        "naturals",
        |(n,): (u64,)| {
            calls.hit();
            (0..n).map(Ok::<_, Infallible>)
        },
    );

    let mut iter = naturals.call((10,)).unwrap();
    assert_eq!(iter.next().unwrap().unwrap(), 0);
    assert_eq!(iter.next().unwrap().unwrap(), 1);
    drop(iter);
    assert!(naturals.handle().store().list_keys().unwrap().is_empty());

    let all: Vec<u64> = naturals.call((10,)).unwrap().map(Result::unwrap).collect();
    assert_eq!(all, (0..10).collect::<Vec<_>>());
    assert_eq!(calls.count(), 2);

    // replay can be abandoned as well
    let mut iter = naturals.call((10,)).unwrap();
    assert_eq!(iter.next().unwrap().unwrap(), 0);
    drop(iter);
    assert_eq!(calls.count(), 2);
}

#[test]
fn test_generator_structured_elements() {
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let tokenize = Cached::generator(
        open(cache_root.path(), "tokenize"),
        "tokenize",
        |(input,): (String,)| {
            calls.hit();
            let mut offset = 0;
            input
                .split(' ')
                .map(|word| {
                    let token = Token {
                        text: word.to_owned(),
                        offset,
                    };
                    offset += word.len() + 1;
                    Ok::<_, Infallible>(token)
                })
                .collect::<Vec<_>>()
        },
    );

    let input = "the quick brown fox".to_owned();
    let tokens: Vec<Token> = tokenize.call((input.clone(),)).unwrap().map(Result::unwrap).collect();
    let replayed: Vec<Token> = tokenize.call((input,)).unwrap().map(Result::unwrap).collect();

    assert_eq!(tokens, replayed);
    assert_eq!(tokens.len(), 4);
    assert_eq!(
        tokens[2],
        Token {
            text: "brown".into(),
            offset: 10
        }
    );
    assert_eq!(calls.count(), 1);
}

#[test]
fn test_generator_empty() {
    let cache_root = test_support::tempdir();
    let calls = Calls::default();
    let nothing = Cached::generator(open(cache_root.path(), "nothing"), "nothing", |(): ()| {
        calls.hit();
        std::iter::empty::<Result<String, Infallible>>()
    });

    assert_eq!(nothing.call(()).unwrap().count(), 0);
    assert_eq!(nothing.call(()).unwrap().count(), 0);
    assert_eq!(calls.count(), 1);
    assert_eq!(nothing.handle().store().list_keys().unwrap().len(), 1);
}
