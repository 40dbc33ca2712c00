//! Serializer Module
//!
//! Codec contract between the cache and its payload bytes, plus the two
//! stock codecs: plain JSON and LZ4-framed JSON. The codec's short
//! description tag is embedded into every formatted key, so switching
//! encoders naturally invalidates previously cached entries.

use crate::{CacheError, Result};
use lz4_flex::frame::{BlockMode, FrameDecoder, FrameEncoder, FrameInfo};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Bytes ⇄ typed value codec.
pub trait Serializer: Send + Sync + 'static {
    /// Encode a value into payload bytes.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode payload bytes back into a value.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Short tag identifying the encoding, e.g. `"json"` or `"json-lz4"`.
    fn description(&self) -> &str;
}

/// Plain JSON codec.
#[derive(Debug, Default, Clone)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| CacheError::SerializeFailed(format!("JSON encode failed: {}", e)))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| CacheError::DeserializeFailed(format!("JSON decode failed: {}", e)))
    }

    fn description(&self) -> &str {
        "json"
    }
}

/// JSON codec wrapped in an LZ4 frame (with content checksum).
#[derive(Debug, Default, Clone)]
pub struct JsonLz4Serializer;

impl JsonLz4Serializer {
    fn compress(data: &[u8]) -> Result<Vec<u8>> {
        let mut frame_info = FrameInfo::new();
        frame_info.content_checksum = true;
        frame_info.block_mode = BlockMode::Independent;
        let mut output = Vec::new();
        let mut encoder = FrameEncoder::with_frame_info(frame_info, &mut output);
        encoder
            .write_all(data)
            .map_err(|e| CacheError::SerializeFailed(format!("LZ4 frame encode failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| CacheError::SerializeFailed(format!("LZ4 frame finish failed: {}", e)))?;
        Ok(output)
    }

    fn decompress(data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = FrameDecoder::new(data);
        let mut output = Vec::new();
        decoder
            .read_to_end(&mut output)
            .map_err(|e| CacheError::DeserializeFailed(format!("LZ4 frame decode failed: {}", e)))?;
        Ok(output)
    }
}

impl Serializer for JsonLz4Serializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(value)
            .map_err(|e| CacheError::SerializeFailed(format!("JSON encode failed: {}", e)))?;
        Self::compress(&json)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let json = Self::decompress(bytes)?;
        serde_json::from_slice(&json)
            .map_err(|e| CacheError::DeserializeFailed(format!("JSON decode failed: {}", e)))
    }

    fn description(&self) -> &str {
        "json-lz4"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        count: u32,
    }

    #[test]
    fn json_round_trip() {
        let serializer = JsonSerializer;
        let value = Payload {
            name: "alpha".to_string(),
            count: 7,
        };
        let bytes = serializer.serialize(&value).unwrap();
        let back: Payload = serializer.deserialize(&bytes).unwrap();
        assert_eq!(back, value);
        assert_eq!(serializer.description(), "json");
    }

    #[test]
    fn json_lz4_round_trip() {
        let serializer = JsonLz4Serializer;
        let value = Payload {
            name: "b".repeat(4096),
            count: 42,
        };
        let bytes = serializer.serialize(&value).unwrap();
        // The repeated payload should actually shrink under LZ4.
        assert!(bytes.len() < 4096);
        let back: Payload = serializer.deserialize(&bytes).unwrap();
        assert_eq!(back, value);
        assert_eq!(serializer.description(), "json-lz4");
    }

    #[test]
    fn json_lz4_rejects_garbage() {
        let serializer = JsonLz4Serializer;
        let result: Result<Payload> = serializer.deserialize(b"definitely not an lz4 frame");
        assert!(matches!(result, Err(CacheError::DeserializeFailed(_))));
    }
}
