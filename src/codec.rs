//! Pluggable value codecs
//!
//! A codec turns domain values into record payloads and back. Decode
//! failures are confined to the record being decoded.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;

/// Failure to encode or decode a payload
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("malformed payload: {0}")]
    Decode(String),
}

/// Converts values of `T` to and from payload bytes
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Bytes, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// UTF-8 string codec
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// JSON codec for any serde type
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec<T> {
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        sku: String,
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec::<Order>::new();
        let order = Order {
            id: 7,
            sku: "A-1".to_string(),
        };
        let bytes = codec.encode(&order).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), order);
    }

    #[test]
    fn test_json_codec_rejects_malformed_input() {
        let codec = JsonCodec::<Order>::new();
        let err = codec.decode(b"{\"id\": \"not a number\"}").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_string_codec_rejects_invalid_utf8() {
        assert!(StringCodec.decode(&[0xff, 0xfe]).is_err());
        assert_eq!(StringCodec.decode(b"hello").unwrap(), "hello");
    }
}
