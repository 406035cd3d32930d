//! Encoding between the compact (encoded tier) and ready-to-use (decoded tier)
//! representations of a cached value.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

/// Converts values to and from their compact form.
pub trait CacheCodec<T>: Send + Sync {
    /// Produce the compact form of `value`
    fn encode(&self, value: &T) -> std::io::Result<Bytes>;

    /// Materialize a value from its compact form
    fn decode(&self, encoded: &Bytes) -> std::io::Result<T>;

    /// Cost of a decoded value in bytes
    fn cost(&self, value: &T) -> usize;
}

/// zlib compression for raw byte payloads
#[derive(Debug, Clone, Copy)]
pub struct DeflateCodec {
    level: Compression,
}

impl DeflateCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self {
            level: Compression::fast(),
        }
    }
}

impl CacheCodec<Bytes> for DeflateCodec {
    fn encode(&self, value: &Bytes) -> std::io::Result<Bytes> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(value.len() / 2), self.level);
        encoder.write_all(value)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn decode(&self, encoded: &Bytes) -> std::io::Result<Bytes> {
        let mut decoder = ZlibDecoder::new(&encoded[..]);
        let mut out = Vec::with_capacity(encoded.len() * 2);
        decoder.read_to_end(&mut out)?;
        Ok(Bytes::from(out))
    }

    fn cost(&self, value: &Bytes) -> usize {
        value.len()
    }
}

/// Stores bytes as-is in both tiers
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl CacheCodec<Bytes> for IdentityCodec {
    fn encode(&self, value: &Bytes) -> std::io::Result<Bytes> {
        Ok(value.clone())
    }

    fn decode(&self, encoded: &Bytes) -> std::io::Result<Bytes> {
        Ok(encoded.clone())
    }

    fn cost(&self, value: &Bytes) -> usize {
        value.len()
    }
}
