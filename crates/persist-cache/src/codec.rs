//! Encoding of cached results into entry payloads.
//!
//! Values are serialized with `bincode` and compressed with `zstd`. Sequences produced by
//! generators are framed element by element within a single zstd stream:
//!
//! ```text
//! 0x01 <u64 LE length> <bincode element>    (once per element)
//! 0x00                                      (end of sequence)
//! ```
//!
//! A sequence payload that ends before its terminator is malformed, which makes a truncated
//! write detectable even though no complete entry is ever renamed into place.

use std::io::{self, Cursor, Read, Write};
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CacheError, CacheResult};

const FRAME_ELEMENT: u8 = 0x01;
const FRAME_END: u8 = 0x00;

/// Encodes a single value.
///
/// The format is not self-describing, so types that deserialize through `deserialize_any`
/// (untagged enums, `serde_json::Value`) encode fine but fail to decode.
pub fn encode_value<T: Serialize + ?Sized>(value: &T, level: i32) -> CacheResult<Vec<u8>> {
    let serialized = bincode::serialize(value).map_err(|e| CacheError::Encode(e.to_string()))?;
    Ok(zstd::stream::encode_all(serialized.as_slice(), level)?)
}

/// Decodes a single value previously encoded with [`encode_value`].
pub fn decode_value<T: DeserializeOwned>(payload: &[u8]) -> CacheResult<T> {
    let serialized = zstd::stream::decode_all(payload).map_err(CacheError::malformed)?;
    bincode::deserialize(&serialized).map_err(CacheError::malformed)
}

/// Incrementally encodes a sequence, one element at a time.
pub struct SequenceEncoder {
    encoder: zstd::stream::Encoder<'static, Vec<u8>>,
    scratch: Vec<u8>,
    count: usize,
}

impl SequenceEncoder {
    pub fn new(level: i32) -> CacheResult<Self> {
        Ok(Self {
            encoder: zstd::stream::Encoder::new(Vec::new(), level)?,
            scratch: Vec::new(),
            count: 0,
        })
    }

    /// Appends one element to the sequence.
    pub fn push<T: Serialize + ?Sized>(&mut self, element: &T) -> CacheResult<()> {
        self.scratch.clear();
        bincode::serialize_into(&mut self.scratch, element)
            .map_err(|e| CacheError::Encode(e.to_string()))?;

        self.encoder.write_all(&[FRAME_ELEMENT])?;
        self.encoder
            .write_all(&(self.scratch.len() as u64).to_le_bytes())?;
        self.encoder.write_all(&self.scratch)?;
        self.count += 1;
        Ok(())
    }

    /// The number of elements pushed so far.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Terminates the sequence and returns the complete payload.
    pub fn finish(mut self) -> CacheResult<Vec<u8>> {
        self.encoder.write_all(&[FRAME_END])?;
        Ok(self.encoder.finish()?)
    }
}

impl std::fmt::Debug for SequenceEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceEncoder")
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

/// Encodes a complete sequence.
pub fn encode_sequence<'a, T, I>(elements: I, level: i32) -> CacheResult<Vec<u8>>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut encoder = SequenceEncoder::new(level)?;
    for element in elements {
        encoder.push(element)?;
    }
    encoder.finish()
}

type FrameReader = zstd::stream::Decoder<'static, io::BufReader<Cursor<Vec<u8>>>>;

/// Lazily decodes a sequence previously encoded with a [`SequenceEncoder`].
///
/// Yields each element in order and stops at the terminator. Any decoding failure is yielded
/// once as [`CacheError::Malformed`], after which the decoder is exhausted.
pub struct SequenceDecoder<T> {
    reader: Option<FrameReader>,
    _element: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> SequenceDecoder<T> {
    pub fn new(payload: Vec<u8>) -> CacheResult<Self> {
        let reader =
            zstd::stream::Decoder::new(Cursor::new(payload)).map_err(CacheError::malformed)?;
        Ok(Self {
            reader: Some(reader),
            _element: PhantomData,
        })
    }

    fn read_frame(reader: &mut FrameReader) -> CacheResult<Option<T>> {
        let mut marker = [0; 1];
        reader
            .read_exact(&mut marker)
            .map_err(|_| CacheError::malformed("sequence ended without terminator"))?;

        match marker[0] {
            FRAME_END => Ok(None),
            FRAME_ELEMENT => {
                let mut len = [0; 8];
                reader
                    .read_exact(&mut len)
                    .map_err(|_| CacheError::malformed("truncated element header"))?;
                let len = u64::from_le_bytes(len);

                let mut element = Vec::new();
                reader
                    .by_ref()
                    .take(len)
                    .read_to_end(&mut element)
                    .map_err(CacheError::malformed)?;
                if element.len() as u64 != len {
                    return Err(CacheError::malformed("truncated element"));
                }

                bincode::deserialize(&element)
                    .map(Some)
                    .map_err(CacheError::malformed)
            }
            other => Err(CacheError::malformed(format!(
                "unknown frame marker {other:#04x}"
            ))),
        }
    }
}

impl<T: DeserializeOwned> Iterator for SequenceDecoder<T> {
    type Item = CacheResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        match Self::read_frame(reader) {
            Ok(Some(element)) => Some(Ok(element)),
            Ok(None) => {
                self.reader = None;
                None
            }
            Err(err) => {
                self.reader = None;
                Some(Err(err))
            }
        }
    }
}

impl<T: DeserializeOwned> std::iter::FusedIterator for SequenceDecoder<T> {}

/// Decodes a complete sequence.
pub fn decode_sequence<T: DeserializeOwned>(payload: Vec<u8>) -> CacheResult<Vec<T>> {
    SequenceDecoder::new(payload)?.collect()
}
