//! Derivation of [`EntryKey`]s from call arguments.
//!
//! Arguments are canonically encoded at the time they are pushed into [`CallArgs`]. The
//! [`KeyDeriver`] then hashes the callable identity together with all encoded arguments into
//! an [`EntryKey`], which in turn determines the file name of the cache entry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use xxhash_rust::xxh3::{xxh3_64, xxh3_128};

use crate::error::{CacheError, CacheResult};

mod canonical;

pub use canonical::{EncodeError, to_canonical_bytes};

/// The key of a single cache entry.
///
/// This is the xxh3-128 hash of the canonical call stream, together with the length of that
/// stream. It renders as 32 lowercase hex digits followed by the decimal length, which is
/// also the file stem of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    hash: u128,
    len: u64,
}

impl EntryKey {
    pub fn new(hash: u128, len: u64) -> Self {
        Self { hash, len }
    }

    pub fn digest(&self) -> u128 {
        self.hash
    }

    /// The length of the canonical call stream this key was derived from.
    pub fn stream_len(&self) -> u64 {
        self.len
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}{}", self.hash, self.len)
    }
}

/// A file stem that is not the rendering of an [`EntryKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid entry key: {0:?}")]
pub struct ParseEntryKeyError(String);

impl FromStr for EntryKey {
    type Err = ParseEntryKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEntryKeyError(s.to_owned());

        let (hash, len) = match (s.get(..32), s.get(32..)) {
            (Some(hash), Some(len)) if !len.is_empty() => (hash, len),
            _ => return Err(invalid()),
        };
        let hash = u128::from_str_radix(hash, 16).map_err(|_| invalid())?;
        let len = len.parse().map_err(|_| invalid())?;

        // rejects uppercase digits, leading zeros and signs
        let key = Self { hash, len };
        if key.to_string() != s {
            return Err(invalid());
        }
        Ok(key)
    }
}

/// Returns the name of the directory holding the cache called `name`.
///
/// This is the xxh3-64 hash of the name as 16 lowercase hex digits, followed by the decimal
/// byte length of the name.
pub fn cache_dir_name(name: &str) -> String {
    format!("{:016x}{}", xxh3_64(name.as_bytes()), name.len())
}

/// The canonically encoded arguments of a single call.
///
/// Positional arguments keep their order, keyword arguments are sorted by name. Encoding
/// failures are remembered and surface once the key is derived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs {
    positional: Vec<Vec<u8>>,
    keyword: BTreeMap<String, Vec<u8>>,
    error: Option<String>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn positional<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.push_positional(value);
        self
    }

    /// Sets a keyword argument, replacing an earlier one of the same name.
    pub fn keyword<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        if let Some(encoded) = self.encode(value) {
            self.keyword.insert(name.into(), encoded);
        }
        self
    }

    pub fn push_positional<T: Serialize + ?Sized>(&mut self, value: &T) {
        if let Some(encoded) = self.encode(value) {
            self.positional.push(encoded);
        }
    }

    fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Option<Vec<u8>> {
        match to_canonical_bytes(value) {
            Ok(encoded) => Some(encoded),
            Err(err) => {
                self.error.get_or_insert_with(|| err.to_string());
                None
            }
        }
    }

    /// Maps positional arguments onto the parameter names of `signature`.
    ///
    /// Explicitly given keyword arguments take precedence. Parameters that are still missing
    /// take their default. Surplus positional arguments are collected into the variadic
    /// parameter as a sequence, if the signature has one.
    fn inflate(mut self, signature: &Signature) -> Self {
        let mut positional = std::mem::take(&mut self.positional).into_iter();

        for name in &signature.params {
            let Some(value) = positional.next() else {
                break;
            };
            self.keyword.entry(name.clone()).or_insert(value);
        }

        match &signature.variadic {
            Some(variadic) => {
                let rest: Vec<_> = positional.collect();
                let mut seq = vec![canonical::SEQ_TAG];
                canonical::write_len(&mut seq, rest.len());
                for value in rest {
                    seq.extend_from_slice(&value);
                }
                self.keyword.entry(variadic.clone()).or_insert(seq);
            }
            None => self.positional = positional.collect(),
        }

        for (name, default) in &signature.defaults {
            self.keyword
                .entry(name.clone())
                .or_insert_with(|| default.clone());
        }

        self
    }
}

/// Call arguments that can be turned into [`CallArgs`].
///
/// This is implemented for `()`, for tuples of up to eight serializable values, which are
/// treated as positional arguments, and for [`CallArgs`] itself. A method receiver is never
/// part of the arguments: cached closures capture it instead.
///
/// Sequences are encoded in iteration order. Hash-ordered collections such as `HashSet` must
/// be passed as a `BTreeSet` or sorted, or equal sets may derive different keys. Maps are
/// sorted during encoding and need no such care.
pub trait CacheArgs {
    fn call_args(&self) -> CallArgs;
}

impl CacheArgs for CallArgs {
    fn call_args(&self) -> CallArgs {
        self.clone()
    }
}

impl CacheArgs for () {
    fn call_args(&self) -> CallArgs {
        CallArgs::new()
    }
}

macro_rules! impl_cache_args_for_tuple {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Serialize),+> CacheArgs for ($($name,)+) {
            fn call_args(&self) -> CallArgs {
                CallArgs::new()$(.positional(&self.$idx))+
            }
        }
    };
}

impl_cache_args_for_tuple!(A: 0);
impl_cache_args_for_tuple!(A: 0, B: 1);
impl_cache_args_for_tuple!(A: 0, B: 1, C: 2);
impl_cache_args_for_tuple!(A: 0, B: 1, C: 2, D: 3);
impl_cache_args_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_cache_args_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_cache_args_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_cache_args_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// The parameter names of a cached callable.
///
/// With a signature attached, `f(1, y = 2)` and `f(x = 1, y = 2)` derive the same key. If
/// `y` defaults to `2`, so does `f(1)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    params: Vec<String>,
    variadic: Option<String>,
    defaults: BTreeMap<String, Vec<u8>>,
}

impl Signature {
    pub fn new<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            variadic: None,
            defaults: BTreeMap::new(),
        }
    }

    /// Sets the default value of the parameter `name`.
    ///
    /// A call that leaves the parameter out derives the same key as one passing `value`.
    pub fn with_default<T: Serialize + ?Sized>(
        mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, EncodeError> {
        self.defaults.insert(name.into(), to_canonical_bytes(value)?);
        Ok(self)
    }

    /// Names the parameter collecting all surplus positional arguments.
    pub fn with_variadic(mut self, name: impl Into<String>) -> Self {
        self.variadic = Some(name.into());
        self
    }
}

/// Derives [`EntryKey`]s for calls of one callable.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    identity: Arc<str>,
    signature: Option<Arc<Signature>>,
}

impl KeyDeriver {
    /// Creates a key deriver for the callable with the given stable `identity`.
    pub fn new(identity: impl Into<Arc<str>>) -> Self {
        Self {
            identity: identity.into(),
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(Arc::new(signature));
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Derives the key for a call with `args`.
    pub fn derive(&self, args: &(impl CacheArgs + ?Sized)) -> CacheResult<EntryKey> {
        let mut args = args.call_args();
        if let Some(signature) = &self.signature {
            args = args.inflate(signature);
        }
        let key = derive_key(&self.identity, &args)?;
        tracing::trace!(identity = %self.identity, %key, "derived cache key");
        Ok(key)
    }
}

/// Derives the key for calling `identity` with `args`.
///
/// The hashed stream consists of the identity, followed by all positional arguments in order,
/// followed by all keyword arguments sorted by name. Each piece is length-prefixed.
pub fn derive_key(identity: &str, args: &CallArgs) -> CacheResult<EntryKey> {
    if let Some(error) = &args.error {
        return Err(CacheError::KeyDerivation(error.clone()));
    }

    let mut stream = Vec::new();
    canonical::write_str(&mut stream, identity);

    canonical::write_len(&mut stream, args.positional.len());
    for value in &args.positional {
        canonical::write_len(&mut stream, value.len());
        stream.extend_from_slice(value);
    }

    canonical::write_len(&mut stream, args.keyword.len());
    for (name, value) in &args.keyword {
        canonical::write_str(&mut stream, name);
        canonical::write_len(&mut stream, value.len());
        stream.extend_from_slice(value);
    }

    Ok(EntryKey {
        hash: xxh3_128(&stream),
        len: stream.len() as u64,
    })
}
