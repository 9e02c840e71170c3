//! Transparent caching of callables.
//!
//! A [`Cached`] wraps a callable together with the [`CacheHandle`] its results are stored in.
//! There are four kinds of callables, fixed by the constructor used to wrap them:
//!
//! | constructor                       | callable returns                   | `call` returns                 |
//! |-----------------------------------|------------------------------------|--------------------------------|
//! | [`Cached::function`]              | `Result<T, E>`                     | `Result<T, CallError<E>>`      |
//! | [`Cached::async_function`]        | `Future<Output = Result<T, E>>`    | the same, asynchronously       |
//! | [`Cached::generator`]             | `IntoIterator<Item = Result<T, E>>`| a [`CachedIter`]               |
//! | [`Cached::async_generator`]       | `Stream<Item = Result<T, E>>`      | a [`BoxStream`]                |
//!
//! Results are only persisted once the callable succeeded. For generators this means the
//! source was exhausted without yielding an error; every element is passed on to the consumer
//! as soon as it is produced, and dropping the iterator or stream early persists nothing. On
//! a cache hit, the captured elements are replayed in order.
//!
//! Concurrent misses on the same key are not coalesced: every caller executes the callable,
//! and the last writer wins.
//!
//! The asynchronous kinds run all filesystem and lock operations on the blocking thread pool
//! of the tokio runtime, so waiting for a lock only suspends the calling task.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use std::{fmt, mem, vec};

use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{SequenceEncoder, decode_sequence, decode_value, encode_value};
use crate::error::{CacheError, CacheResult, CallError};
use crate::expiry::FlushStats;
use crate::handle::CacheHandle;
use crate::key::{CacheArgs, EntryKey, KeyDeriver, Signature};
use crate::store::Store;

/// The kind of a cached callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    /// A plain function returning a single value.
    Function,
    /// A function returning a future of a single value.
    AsyncFunction,
    /// A function returning an iterator.
    Generator,
    /// A function returning a stream.
    AsyncGenerator,
}

impl fmt::Display for CallableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Function => "function",
            Self::AsyncFunction => "async function",
            Self::Generator => "generator",
            Self::AsyncGenerator => "async generator",
        };
        f.write_str(name)
    }
}

/// A callable of a known [`CallableKind`].
pub trait Callable {
    const KIND: CallableKind;
}

/// A plain function, see [`Cached::function`].
pub struct Function<F>(F);

/// A function returning a future, see [`Cached::async_function`].
pub struct AsyncFunction<F>(F);

/// A function returning an iterator, see [`Cached::generator`].
pub struct Generator<F>(F);

/// A function returning a stream, see [`Cached::async_generator`].
pub struct AsyncGenerator<F>(F);

impl<F> Callable for Function<F> {
    const KIND: CallableKind = CallableKind::Function;
}

impl<F> Callable for AsyncFunction<F> {
    const KIND: CallableKind = CallableKind::AsyncFunction;
}

impl<F> Callable for Generator<F> {
    const KIND: CallableKind = CallableKind::Generator;
}

impl<F> Callable for AsyncGenerator<F> {
    const KIND: CallableKind = CallableKind::AsyncGenerator;
}

/// A callable whose results are cached in a [`CacheHandle`].
pub struct Cached<C> {
    handle: CacheHandle,
    keys: KeyDeriver,
    callable: C,
}

impl<C: Callable> Cached<C> {
    fn new(handle: CacheHandle, identity: impl Into<Arc<str>>, callable: C) -> Self {
        Self {
            handle,
            keys: KeyDeriver::new(identity),
            callable,
        }
    }

    /// Attaches the parameter names of the callable.
    ///
    /// Positional arguments are then keyed by the name of their parameter, see [`Signature`].
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.keys = self.keys.with_signature(signature);
        self
    }

    pub fn kind(&self) -> CallableKind {
        C::KIND
    }

    /// The stable identity of the callable, which is part of every key.
    pub fn identity(&self) -> &str {
        self.keys.identity()
    }

    pub fn handle(&self) -> &CacheHandle {
        &self.handle
    }

    /// Changes the shelf life of cached results, see [`CacheHandle::set_expiry`].
    pub fn set_expiry(&self, expiry: Option<std::time::Duration>) {
        self.handle.set_expiry(expiry)
    }

    /// Removes all results that outlived the configured expiry.
    pub fn flush(&self) -> CacheResult<FlushStats> {
        self.handle.flush(None)
    }

    /// Removes all cached results.
    pub fn clear(&self) -> CacheResult<FlushStats> {
        self.handle.clear()
    }

    /// Removes the whole cache, including its directory.
    pub fn delete(&self) -> CacheResult<()> {
        self.handle.delete()
    }

    fn derive_key(&self, args: &impl CacheArgs) -> CacheResult<EntryKey> {
        self.keys.derive(args)
    }

    fn log_miss(&self, key: &EntryKey) {
        tracing::debug!(
            cache = self.handle.name(),
            identity = self.identity(),
            kind = %C::KIND,
            %key,
            "cache miss"
        );
    }
}

impl<C: Callable> fmt::Debug for Cached<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cached")
            .field("kind", &C::KIND)
            .field("identity", &self.identity())
            .field("handle", &self.handle)
            .finish()
    }
}

impl<F> Cached<Function<F>> {
    /// Wraps a plain function.
    pub fn function<A, T, E>(handle: CacheHandle, identity: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(A) -> Result<T, E>,
    {
        Self::new(handle, identity, Function(f))
    }

    /// Calls the function, or returns its cached result.
    pub fn call<A, T, E>(&self, args: A) -> Result<T, CallError<E>>
    where
        F: Fn(A) -> Result<T, E>,
        A: CacheArgs,
        T: Serialize + DeserializeOwned,
    {
        let key = self.derive_key(&args)?;
        let store = self.handle.store();

        if let Some(value) = load_entry(&store, &key, |payload| decode_value(&payload))? {
            return Ok(value);
        }
        self.log_miss(&key);

        let value = (self.callable.0)(args).map_err(CallError::Callable)?;

        let payload = encode_value(&value, self.handle.compression_level())?;
        store.put(&key, &payload, SystemTime::now())?;
        Ok(value)
    }
}

impl<F> Cached<AsyncFunction<F>> {
    /// Wraps a function returning a future.
    pub fn async_function<A, Fut, T, E>(
        handle: CacheHandle,
        identity: impl Into<Arc<str>>,
        f: F,
    ) -> Self
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        Self::new(handle, identity, AsyncFunction(f))
    }

    /// Calls the function and awaits its result, or returns its cached result.
    ///
    /// # Panics
    ///
    /// Panics when polled outside of a tokio runtime, since store operations run on its
    /// blocking pool.
    pub async fn call<A, Fut, T, E>(&self, args: A) -> Result<T, CallError<E>>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: CacheArgs,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let key = self.derive_key(&args)?;
        let store = self.handle.store();

        let cached = {
            let store = store.clone();
            run_blocking(move || load_entry(&store, &key, |payload| decode_value(&payload)))
                .await?
        };
        if let Some(value) = cached {
            return Ok(value);
        }
        self.log_miss(&key);

        let value = (self.callable.0)(args)
            .await
            .map_err(CallError::Callable)?;

        let payload = encode_value(&value, self.handle.compression_level())?;
        run_blocking(move || store.put(&key, &payload, SystemTime::now())).await?;
        Ok(value)
    }
}

impl<F> Cached<Generator<F>> {
    /// Wraps a function returning an iterator.
    pub fn generator<A, I, T, E>(handle: CacheHandle, identity: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(A) -> I,
        I: IntoIterator<Item = Result<T, E>>,
    {
        Self::new(handle, identity, Generator(f))
    }

    /// Calls the function, or replays its cached elements.
    ///
    /// The function is only called on a cache miss. Its elements are persisted once the
    /// returned iterator is exhausted, see [`CachedIter`].
    pub fn call<A, I, T, E>(&self, args: A) -> CacheResult<CachedIter<I::IntoIter, T>>
    where
        F: Fn(A) -> I,
        I: IntoIterator<Item = Result<T, E>>,
        A: CacheArgs,
        T: Serialize + DeserializeOwned,
    {
        let key = self.derive_key(&args)?;
        let store = self.handle.store();

        if let Some(elements) = load_entry(&store, &key, decode_sequence)? {
            return Ok(CachedIter {
                state: IterState::Replaying(elements.into_iter()),
            });
        }
        self.log_miss(&key);

        let recorder = Recorder::new(store, key)?;
        let source = (self.callable.0)(args).into_iter();
        Ok(CachedIter {
            state: IterState::Capturing { source, recorder },
        })
    }
}

impl<F> Cached<AsyncGenerator<F>> {
    /// Wraps a function returning a stream.
    pub fn async_generator<A, S, T, E>(
        handle: CacheHandle,
        identity: impl Into<Arc<str>>,
        f: F,
    ) -> Self
    where
        F: Fn(A) -> S,
        S: Stream<Item = Result<T, E>>,
    {
        Self::new(handle, identity, AsyncGenerator(f))
    }

    /// Calls the function, or replays its cached elements.
    ///
    /// The function is only called on a cache miss. Its elements are persisted once the
    /// returned stream is exhausted. A replayed stream yields to the scheduler between
    /// elements.
    ///
    /// # Panics
    ///
    /// Panics when polled outside of a tokio runtime, since store operations run on its
    /// blocking pool.
    pub async fn call<A, S, T, E>(
        &self,
        args: A,
    ) -> CacheResult<BoxStream<'static, Result<T, CallError<E>>>>
    where
        F: Fn(A) -> S,
        S: Stream<Item = Result<T, E>> + Send + 'static,
        A: CacheArgs,
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Send + 'static,
    {
        let key = self.derive_key(&args)?;
        let store = self.handle.store();

        let cached = {
            let store = store.clone();
            run_blocking(move || load_entry(&store, &key, decode_sequence)).await?
        };
        if let Some(elements) = cached {
            return Ok(replay_stream(elements));
        }
        self.log_miss(&key);

        let recorder = Recorder::new(store, key)?;
        let source = (self.callable.0)(args).boxed();
        Ok(capture_stream(source, recorder))
    }
}

/// Reads and decodes the entry with `key`.
///
/// Malformed entries are logged and removed, and treated as a miss.
fn load_entry<T>(
    store: &Store,
    key: &EntryKey,
    decode: impl FnOnce(Vec<u8>) -> CacheResult<T>,
) -> CacheResult<Option<T>> {
    let Some(entry) = store.get(key)? else {
        return Ok(None);
    };

    match decode(entry.payload) {
        Ok(value) => Ok(Some(value)),
        Err(err @ CacheError::Malformed(_)) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                cache = store.handle().name(),
                %key,
                "removing malformed cache entry"
            );
            store.remove(key)?;
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Runs blocking cache work on the blocking thread pool.
async fn run_blocking<F, R>(f: F) -> CacheResult<R>
where
    F: FnOnce() -> CacheResult<R> + Send + 'static,
    R: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => Err(CacheError::Storage(io::Error::other(err))),
    }
}

/// Encodes the elements of a generator as they are produced, and persists them once the
/// generator is exhausted.
struct Recorder {
    store: Store,
    key: EntryKey,
    encoder: SequenceEncoder,
    /// The first element that failed to encode. Reported once the generator is exhausted.
    error: Option<CacheError>,
}

impl Recorder {
    fn new(store: Store, key: EntryKey) -> CacheResult<Self> {
        let encoder = SequenceEncoder::new(store.handle().compression_level())?;
        Ok(Self {
            store,
            key,
            encoder,
            error: None,
        })
    }

    fn record<T: Serialize>(&mut self, element: &T) {
        if self.error.is_none() {
            if let Err(err) = self.encoder.push(element) {
                self.error = Some(err);
            }
        }
    }

    fn persist(self) -> CacheResult<()> {
        let Self {
            store,
            key,
            encoder,
            error,
        } = self;
        if let Some(err) = error {
            return Err(err);
        }

        let elements = encoder.len();
        let payload = encoder.finish()?;
        store.put(&key, &payload, SystemTime::now())?;
        tracing::trace!(cache = store.handle().name(), %key, elements, "captured generator");
        Ok(())
    }

    fn abandon(self) {
        tracing::debug!(
            cache = self.store.handle().name(),
            key = %self.key,
            "generator failed, nothing was cached"
        );
    }
}

/// The iterator returned by calling a cached generator.
///
/// On a cache hit, this replays the cached elements. On a miss, this passes on the elements
/// of the source iterator as they are produced, and persists them once the source is
/// exhausted. If persisting fails, the error is yielded as one final item.
///
/// The first error of the source ends the iteration, and nothing is cached.
pub struct CachedIter<S, T> {
    state: IterState<S, T>,
}

enum IterState<S, T> {
    Replaying(vec::IntoIter<T>),
    Capturing { source: S, recorder: Recorder },
    Done,
}

impl<S, T, E> Iterator for CachedIter<S, T>
where
    S: Iterator<Item = Result<T, E>>,
    T: Serialize,
{
    type Item = Result<T, CallError<E>>;

    fn next(&mut self) -> Option<Self::Item> {
        match mem::replace(&mut self.state, IterState::Done) {
            IterState::Replaying(mut elements) => {
                let element = elements.next()?;
                self.state = IterState::Replaying(elements);
                Some(Ok(element))
            }
            IterState::Capturing {
                mut source,
                mut recorder,
            } => match source.next() {
                Some(Ok(element)) => {
                    recorder.record(&element);
                    self.state = IterState::Capturing { source, recorder };
                    Some(Ok(element))
                }
                Some(Err(err)) => {
                    recorder.abandon();
                    Some(Err(CallError::Callable(err)))
                }
                None => recorder.persist().err().map(|err| Err(err.into())),
            },
            IterState::Done => None,
        }
    }
}

impl<S, T, E> std::iter::FusedIterator for CachedIter<S, T>
where
    S: Iterator<Item = Result<T, E>>,
    T: Serialize,
{
}

impl<S, T> fmt::Debug for CachedIter<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            IterState::Replaying(_) => "replaying",
            IterState::Capturing { .. } => "capturing",
            IterState::Done => "done",
        };
        f.debug_struct("CachedIter").field("state", &state).finish()
    }
}

fn replay_stream<T, E>(elements: Vec<T>) -> BoxStream<'static, Result<T, CallError<E>>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    futures::stream::unfold(
        (elements.into_iter(), true),
        |(mut elements, first)| async move {
            if !first {
                tokio::task::yield_now().await;
            }
            let Some(element) = elements.next() else {
                return None;
            };
            Some((Ok(element), (elements, false)))
        },
    )
    .boxed()
}

enum StreamState<T, E> {
    Capturing {
        source: BoxStream<'static, Result<T, E>>,
        recorder: Recorder,
    },
    Done,
}

fn capture_stream<T, E>(
    source: BoxStream<'static, Result<T, E>>,
    recorder: Recorder,
) -> BoxStream<'static, Result<T, CallError<E>>>
where
    T: Serialize + Send + 'static,
    E: Send + 'static,
{
    let state = StreamState::Capturing { source, recorder };
    futures::stream::unfold(state, |state| async move {
        let StreamState::Capturing {
            mut source,
            mut recorder,
        } = state
        else {
            return None;
        };

        match source.next().await {
            Some(Ok(element)) => {
                recorder.record(&element);
                Some((Ok(element), StreamState::Capturing { source, recorder }))
            }
            Some(Err(err)) => {
                recorder.abandon();
                Some((Err(CallError::Callable(err)), StreamState::Done))
            }
            None => match run_blocking(move || recorder.persist()).await {
                Ok(()) => None,
                Err(err) => Some((Err(err.into()), StreamState::Done)),
            },
        }
    })
    .boxed()
}
