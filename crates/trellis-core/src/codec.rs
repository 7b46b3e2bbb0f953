//! Per-method payload codecs.
//!
//! The server core never interprets payload bytes. Each registered method
//! brings a [`Serializer`] for its responses and a [`Deserializer`] for its
//! requests; any failure is reported as a [`CodecError`] and turned into a
//! terminal status by the dispatcher.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::status::Status;

/// A payload could not be encoded or decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecError {
    message: String,
}

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        CodecError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Terminal status for a request that failed to decode.
    pub fn request_status(&self) -> Status {
        Status::internal(format!("failed to parse request: {}", self.message))
    }

    /// Terminal status for a response that failed to encode.
    pub fn response_status(&self) -> Status {
        Status::internal(format!("failed to serialize response: {}", self.message))
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "codec error: {}", self.message)
    }
}

impl std::error::Error for CodecError {}

impl From<std::string::FromUtf8Error> for CodecError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        CodecError::new(err.to_string())
    }
}

/// Encodes values of `T` into payload bytes.
pub struct Serializer<T> {
    encode: Arc<dyn Fn(&T) -> Result<Bytes, CodecError> + Send + Sync>,
}

impl<T> Serializer<T> {
    pub fn new<F>(encode: F) -> Self
    where
        F: Fn(&T) -> Result<Bytes, CodecError> + Send + Sync + 'static,
    {
        Serializer {
            encode: Arc::new(encode),
        }
    }

    pub fn serialize(&self, value: &T) -> Result<Bytes, CodecError> {
        (self.encode)(value)
    }
}

impl<T> Clone for Serializer<T> {
    fn clone(&self) -> Self {
        Serializer {
            encode: self.encode.clone(),
        }
    }
}

impl<T> fmt::Debug for Serializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer").finish_non_exhaustive()
    }
}

/// Decodes payload bytes into values of `T`.
pub struct Deserializer<T> {
    decode: Arc<dyn Fn(&[u8]) -> Result<T, CodecError> + Send + Sync>,
}

impl<T> Deserializer<T> {
    pub fn new<F>(decode: F) -> Self
    where
        F: Fn(&[u8]) -> Result<T, CodecError> + Send + Sync + 'static,
    {
        Deserializer {
            decode: Arc::new(decode),
        }
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<T, CodecError> {
        (self.decode)(bytes)
    }
}

impl<T> Clone for Deserializer<T> {
    fn clone(&self) -> Self {
        Deserializer {
            decode: self.decode.clone(),
        }
    }
}

impl<T> fmt::Debug for Deserializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deserializer").finish_non_exhaustive()
    }
}

/// Pass-through codec pair for methods that speak raw bytes.
pub fn raw() -> (Serializer<Bytes>, Deserializer<Bytes>) {
    (
        Serializer::new(|b: &Bytes| Ok(b.clone())),
        Deserializer::new(|b: &[u8]| Ok(Bytes::copy_from_slice(b))),
    )
}

/// UTF-8 string codec pair.
pub fn utf8() -> (Serializer<String>, Deserializer<String>) {
    (
        Serializer::new(|s: &String| Ok(Bytes::copy_from_slice(s.as_bytes()))),
        Deserializer::new(|b: &[u8]| Ok(String::from_utf8(b.to_vec())?)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_codec_rejects_invalid_bytes() {
        let (ser, de) = utf8();
        let bytes = ser.serialize(&"héllo".to_string()).unwrap();
        assert_eq!(de.deserialize(&bytes).unwrap(), "héllo");
        assert!(de.deserialize(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn raw_codec_passes_bytes_through() {
        let (ser, de) = raw();
        let input = Bytes::from_static(b"\x00\x01raw");
        assert_eq!(ser.serialize(&input).unwrap(), input);
        assert_eq!(de.deserialize(b"abc").unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn codec_failures_map_to_internal() {
        let err = CodecError::new("truncated");
        let status = err.request_status();
        assert_eq!(status.code(), crate::status::Code::Internal);
        assert!(status.details().contains("truncated"));
        assert!(err.response_status().details().contains("serialize"));
    }
}
