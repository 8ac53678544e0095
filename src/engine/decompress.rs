//! Optional decompression of raw response payloads
//!
//! Servers may wrap a handler list in an object whose `compressedResult`
//! (or `compressedData`) member is base64 of a gzip or zlib stream. This pass
//! unwraps that before anything interprets the payload; uncompressed payloads
//! pass through untouched.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::read::{GzDecoder, ZlibDecoder};
use serde_json::Value;
use std::io::{self, Read};
use thiserror::Error;

/// Members that carry a compressed payload
pub const COMPRESSED_KEYS: &[&str] = &["compressedResult", "compressedData"];

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZLIB_HEADER: u8 = 0x78;

/// Decompression failures
#[derive(Debug, Error)]
pub enum DecompressError {
    /// Payload was not valid base64
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Stream could not be inflated
    #[error("inflate failed: {0}")]
    Inflate(#[from] io::Error),

    /// Inflated bytes were not JSON
    #[error("decompressed payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Compressed member was not a string
    #[error("compressed member '{0}' is not a string")]
    NotAString(String),
}

/// Decompression pass applied to every raw payload
#[derive(Debug, Clone, Copy)]
pub struct Decompressor {
    enabled: bool,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Decompressor {
    /// Create a decompressor; a disabled one passes payloads through
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Whether decompression is applied
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Unwrap a compressed payload, if it is one
    pub fn apply(&self, payload: Value) -> Result<Value, DecompressError> {
        if !self.enabled {
            return Ok(payload);
        }
        decompress_payload(payload)
    }
}

/// Unwrap compressed members until a plain payload remains
pub fn decompress_payload(payload: Value) -> Result<Value, DecompressError> {
    let mut current = payload;
    // servers never nest more than once or twice; bound it anyway
    for _ in 0..4 {
        let Some((key, encoded)) = compressed_member(&current) else {
            return Ok(current);
        };
        let encoded = encoded
            .as_str()
            .ok_or_else(|| DecompressError::NotAString(key.to_string()))?;
        let bytes = STANDARD.decode(encoded.trim())?;
        let inflated = inflate(&bytes)?;
        tracing::trace!(
            compressed = bytes.len(),
            inflated = inflated.len(),
            "decompressed payload"
        );
        current = serde_json::from_slice(&inflated)?;
    }
    Ok(current)
}

fn compressed_member(value: &Value) -> Option<(&'static str, &Value)> {
    let map = value.as_object()?;
    COMPRESSED_KEYS
        .iter()
        .find_map(|key| map.get(*key).map(|member| (*key, member)))
}

/// Inflate gzip or zlib bytes; anything else is returned as-is
pub fn inflate(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    if bytes.starts_with(&GZIP_MAGIC) {
        GzDecoder::new(bytes).read_to_end(&mut out)?;
    } else if bytes.first() == Some(&ZLIB_HEADER) {
        ZlibDecoder::new(bytes).read_to_end(&mut out)?;
    } else {
        out.extend_from_slice(bytes);
    }
    Ok(out)
}
