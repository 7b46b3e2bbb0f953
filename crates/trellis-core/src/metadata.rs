//! Call metadata: an ordered multi-map of header names to values.
//!
//! Keys are case-insensitive ASCII and are stored lowercased. A key maps to
//! one or more values; a key with no values is never stored, so "absent" and
//! "empty" are the same observable state.
//!
//! Keys ending in [`BINARY_SUFFIX`] carry arbitrary bytes and are base64
//! encoded when converted to transport headers. All other keys carry
//! printable-ASCII text.
//!
//! # Example
//!
//! ```rust
//! use trellis_core::{Metadata, MetadataValue};
//!
//! let mut md = Metadata::new();
//! md.add("x-request-id", "abc").unwrap();
//! md.add("trace-bin", vec![0u8, 1, 2]).unwrap();
//!
//! let headers = md.to_headers();
//! let back = Metadata::from_headers(&headers).unwrap();
//! assert_eq!(back, md);
//! assert_eq!(back.get("X-Request-Id"), &[MetadataValue::from("abc")]);
//! ```

use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use bytes::Bytes;

/// Suffix marking a key whose values are arbitrary bytes.
pub const BINARY_SUFFIX: &str = "-bin";

/// Transport header block: `(name, value)` pairs in wire order.
pub type HeaderList = Vec<(String, String)>;

/// Padded on encode, indifferent on decode: peers are allowed to strip padding.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetadataValue {
    /// Printable ASCII text, for ordinary keys.
    Text(String),
    /// Arbitrary bytes, for `-bin` keys.
    Binary(Bytes),
}

impl MetadataValue {
    /// The text of a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    /// Raw bytes of the value, whichever kind it is.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Text(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, MetadataValue::Binary(_))
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Text(s)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(b: Vec<u8>) -> Self {
        MetadataValue::Binary(Bytes::from(b))
    }
}

impl From<Bytes> for MetadataValue {
    fn from(b: Bytes) -> Self {
        MetadataValue::Binary(b)
    }
}

impl From<&[u8]> for MetadataValue {
    fn from(b: &[u8]) -> Self {
        MetadataValue::Binary(Bytes::copy_from_slice(b))
    }
}

/// Error for malformed metadata keys or values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// Key is empty or contains characters outside `[a-z0-9-_.]`.
    InvalidKey(String),
    /// Text value contains characters outside printable ASCII.
    InvalidTextValue { key: String },
    /// A byte value was given for a text key.
    BinaryValueForTextKey { key: String },
    /// A text value was given for a `-bin` key.
    TextValueForBinaryKey { key: String },
    /// A `-bin` header value is not valid base64.
    InvalidBinaryValue { key: String },
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::InvalidKey(key) => write!(f, "metadata key {:?} contains illegal characters", key),
            MetadataError::InvalidTextValue { key } => {
                write!(f, "metadata value for {:?} contains illegal characters", key)
            }
            MetadataError::BinaryValueForTextKey { key } => {
                write!(f, "keys that don't end with '-bin' must have text values ({:?})", key)
            }
            MetadataError::TextValueForBinaryKey { key } => {
                write!(f, "keys that end with '-bin' must have binary values ({:?})", key)
            }
            MetadataError::InvalidBinaryValue { key } => {
                write!(f, "metadata value for {:?} is not valid base64", key)
            }
        }
    }
}

impl std::error::Error for MetadataError {}

/// Whether `key` (already lowercased) names binary values.
pub fn is_binary_key(key: &str) -> bool {
    key.ends_with(BINARY_SUFFIX)
}

fn normalize_key(key: &str) -> Result<String, MetadataError> {
    let key = key.to_ascii_lowercase();
    let legal = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.');
    if key.is_empty() || !key.chars().all(legal) {
        return Err(MetadataError::InvalidKey(key));
    }
    Ok(key)
}

fn check_value(key: &str, value: &MetadataValue) -> Result<(), MetadataError> {
    match (is_binary_key(key), value) {
        (true, MetadataValue::Binary(_)) => Ok(()),
        (true, MetadataValue::Text(_)) => Err(MetadataError::TextValueForBinaryKey { key: key.to_owned() }),
        (false, MetadataValue::Binary(_)) => Err(MetadataError::BinaryValueForTextKey { key: key.to_owned() }),
        (false, MetadataValue::Text(s)) => {
            if s.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
                Ok(())
            } else {
                Err(MetadataError::InvalidTextValue { key: key.to_owned() })
            }
        }
    }
}

/// Ordered multi-map of metadata keys to values.
///
/// Equality is order-sensitive: two maps are equal when they hold the same
/// keys in the same first-insertion order with the same value sequences.
/// `clone()` is a deep copy; mutating a clone never affects the original.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Vec<MetadataValue>)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    fn values_mut(&mut self, key: String) -> &mut Vec<MetadataValue> {
        let idx = match self.position(&key) {
            Some(idx) => idx,
            None => {
                self.entries.push((key, Vec::new()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx].1
    }

    /// Replace every value of `key` with `value`.
    pub fn set(&mut self, key: &str, value: impl Into<MetadataValue>) -> Result<(), MetadataError> {
        let key = normalize_key(key)?;
        let value = value.into();
        check_value(&key, &value)?;
        let values = self.values_mut(key);
        values.clear();
        values.push(value);
        Ok(())
    }

    /// Append `value` to the values of `key`.
    pub fn add(&mut self, key: &str, value: impl Into<MetadataValue>) -> Result<(), MetadataError> {
        let key = normalize_key(key)?;
        let value = value.into();
        check_value(&key, &value)?;
        self.values_mut(key).push(value);
        Ok(())
    }

    /// Delete `key` and all its values.
    pub fn remove(&mut self, key: &str) {
        let key = key.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != key);
    }

    /// All values of `key`, in insertion order. Empty when the key is absent.
    pub fn get(&self, key: &str) -> &[MetadataValue] {
        let key = key.to_ascii_lowercase();
        self.position(&key)
            .map(|idx| self.entries[idx].1.as_slice())
            .unwrap_or(&[])
    }

    /// Snapshot of the first value per key.
    ///
    /// Lossy for keys with several values.
    pub fn get_map(&self) -> HashMap<String, MetadataValue> {
        self.entries
            .iter()
            .filter_map(|(k, vs)| vs.first().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        !self.get(key).is_empty()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Iterate `(key, values)` in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[MetadataValue])> {
        self.entries.iter().map(|(k, vs)| (k.as_str(), vs.as_slice()))
    }

    /// Append all of `other`'s values under each of its keys.
    pub fn merge(&mut self, other: &Metadata) {
        for (key, values) in &other.entries {
            self.values_mut(key.clone()).extend(values.iter().cloned());
        }
    }

    /// One header per value, binary values base64 encoded.
    pub fn to_headers(&self) -> HeaderList {
        let mut headers = HeaderList::new();
        for (key, values) in &self.entries {
            for value in values {
                let encoded = match value {
                    MetadataValue::Text(s) => s.clone(),
                    MetadataValue::Binary(b) => BASE64.encode(b),
                };
                headers.push((key.clone(), encoded));
            }
        }
        headers
    }

    /// Rebuild metadata from transport headers, skipping pseudo-headers.
    ///
    /// A `-bin` header may carry several comma-separated base64 values.
    pub fn from_headers(headers: &[(String, String)]) -> Result<Self, MetadataError> {
        let mut md = Metadata::new();
        for (name, value) in headers {
            if name.starts_with(':') {
                continue;
            }
            let key = normalize_key(name)?;
            if is_binary_key(&key) {
                for part in value.split(',') {
                    let bytes = BASE64
                        .decode(part.trim())
                        .map_err(|_| MetadataError::InvalidBinaryValue { key: key.clone() })?;
                    md.values_mut(key.clone()).push(MetadataValue::Binary(Bytes::from(bytes)));
                }
            } else {
                let value = MetadataValue::Text(value.clone());
                check_value(&key, &value)?;
                md.values_mut(key).push(value);
            }
        }
        Ok(md)
    }
}
