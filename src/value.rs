//! User values and the codec that turns them into cache payloads.
//!
//! A stored item is a byte payload plus a small integer client flag that
//! records how to get the user value back: the low bits carry a type tag,
//! bit 4 marks zlib compression, and bits 8+ are reserved for a
//! compression dictionary id. The codec is injected at client
//! construction so deployments can swap the format wholesale.

use crate::error::Error;

/// Type tag mask inside the client flag.
const TYPE_MASK: u32 = 0x0f;
/// Compressed-payload marker.
const FLAG_COMPRESSED: u32 = 1 << 4;
/// Reserved dictionary-id bits.
#[allow(dead_code)]
const DICT_SHIFT: u32 = 8;

const TAG_BYTES: u32 = 0;
const TAG_TEXT: u32 = 1;
const TAG_INT: u32 = 2;

/// A value as seen by callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheValue {
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// UTF-8 text.
    Text(String),
    /// An unsigned integer, stored in its decimal form so the server's
    /// arithmetic commands can operate on it.
    Int(u64),
}

/// The kind of a [`CacheValue`], for typed getters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// Raw bytes.
    Bytes,
    /// UTF-8 text.
    Text,
    /// Unsigned integer.
    Int,
}

impl CacheValue {
    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            CacheValue::Bytes(_) => ValueKind::Bytes,
            CacheValue::Text(_) => ValueKind::Text,
            CacheValue::Int(_) => ValueKind::Int,
        }
    }
}

impl From<&str> for CacheValue {
    fn from(s: &str) -> Self {
        CacheValue::Text(s.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(s: String) -> Self {
        CacheValue::Text(s)
    }
}

impl From<&[u8]> for CacheValue {
    fn from(b: &[u8]) -> Self {
        CacheValue::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(b: Vec<u8>) -> Self {
        CacheValue::Bytes(b)
    }
}

impl From<u64> for CacheValue {
    fn from(n: u64) -> Self {
        CacheValue::Int(n)
    }
}

/// Maps user values to wire payloads and back.
///
/// `encode` returns the payload bytes plus the client flag to store with
/// them; `decode` inverts it. Implementations must be pure with respect
/// to their inputs — the same (payload, flag) pair always decodes to the
/// same value.
pub trait ValueCodec: Send + Sync {
    /// Serializes a value into (payload, client flag).
    fn encode(&self, value: &CacheValue) -> Result<(Vec<u8>, u32), Error>;

    /// Deserializes a payload given the stored client flag.
    fn decode(&self, payload: &[u8], client_flag: u32) -> Result<CacheValue, Error>;
}

/// The stock codec: type-tagged payloads, zlib compression above a size
/// threshold when the `zlib` feature is enabled.
#[derive(Clone, Debug)]
pub struct DefaultCodec {
    compression_threshold: usize,
}

impl DefaultCodec {
    /// Default minimum payload size before compression kicks in.
    pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 4096;

    /// Creates a codec with a custom compression threshold. A threshold
    /// of `usize::MAX` disables compression outright.
    pub fn with_compression_threshold(compression_threshold: usize) -> Self {
        DefaultCodec {
            compression_threshold,
        }
    }
}

impl Default for DefaultCodec {
    fn default() -> Self {
        Self::with_compression_threshold(Self::DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl ValueCodec for DefaultCodec {
    fn encode(&self, value: &CacheValue) -> Result<(Vec<u8>, u32), Error> {
        let (payload, tag) = match value {
            CacheValue::Bytes(b) => (b.clone(), TAG_BYTES),
            CacheValue::Text(s) => (s.as_bytes().to_vec(), TAG_TEXT),
            // Decimal form keeps the item compatible with `ma`.
            CacheValue::Int(n) => (n.to_string().into_bytes(), TAG_INT),
        };

        if tag != TAG_INT && payload.len() >= self.compression_threshold {
            if let Some(compressed) = compress_payload(&payload)? {
                if compressed.len() < payload.len() {
                    return Ok((compressed, tag | FLAG_COMPRESSED));
                }
            }
        }

        Ok((payload, tag))
    }

    fn decode(&self, payload: &[u8], client_flag: u32) -> Result<CacheValue, Error> {
        let payload = if client_flag & FLAG_COMPRESSED != 0 {
            decompress_payload(payload)?
        } else {
            payload.to_vec()
        };

        match client_flag & TYPE_MASK {
            TAG_BYTES => Ok(CacheValue::Bytes(payload)),
            TAG_TEXT => String::from_utf8(payload)
                .map(CacheValue::Text)
                .map_err(|_| Error::Codec("stored text is not valid UTF-8".to_string())),
            TAG_INT => std::str::from_utf8(&payload)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(CacheValue::Int)
                .ok_or_else(|| Error::Codec("stored integer does not parse".to_string())),
            tag => Err(Error::Codec(format!("unknown type tag {}", tag))),
        }
    }
}

#[cfg(feature = "zlib")]
fn compress_payload(data: &[u8]) -> Result<Option<Vec<u8>>, Error> {
    zlib::compress(data).map(Some)
}

#[cfg(not(feature = "zlib"))]
fn compress_payload(_data: &[u8]) -> Result<Option<Vec<u8>>, Error> {
    Ok(None)
}

#[cfg(feature = "zlib")]
fn decompress_payload(data: &[u8]) -> Result<Vec<u8>, Error> {
    zlib::decompress(data)
}

#[cfg(not(feature = "zlib"))]
fn decompress_payload(_data: &[u8]) -> Result<Vec<u8>, Error> {
    Err(Error::Codec(
        "compressed payload but zlib support is disabled".to_string(),
    ))
}

#[cfg(feature = "zlib")]
mod zlib {
    use std::io::{Read, Write};

    use flate2::read::ZlibDecoder;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use crate::error::Error;

    pub(super) fn compress(data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| Error::Codec(format!("zlib compress: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| Error::Codec(format!("zlib compress: {}", e)))
    }

    pub(super) fn decompress(data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map(|_| out)
            .map_err(|e| Error::Codec(format!("zlib decompress: {}", e)))
    }
}
