//! Chunks and encodings.
//!
//! A [`Chunk`] is the payload unit moved by every stream. Byte-mode streams
//! measure chunks by length and may slice or concatenate them; object-mode
//! streams treat each chunk as one indivisible unit.

use crate::error::{StreamError, StreamResult};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Character encodings understood by byte-mode streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Hex,
    Base64,
    Latin1,
    /// Raw bytes, no string conversion.
    Buffer,
}

impl Encoding {
    /// Parse a Node.js encoding name.
    pub fn parse(name: &str) -> StreamResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "hex" => Ok(Self::Hex),
            "base64" => Ok(Self::Base64),
            "latin1" | "binary" => Ok(Self::Latin1),
            "buffer" => Ok(Self::Buffer),
            _ => Err(StreamError::InvalidEncoding(name.to_string())),
        }
    }

    /// Node.js name of the encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Hex => "hex",
            Self::Base64 => "base64",
            Self::Latin1 => "latin1",
            Self::Buffer => "buffer",
        }
    }

    /// Encode a string into bytes using this encoding.
    pub fn encode(&self, text: &str) -> StreamResult<Bytes> {
        let data = match self {
            Self::Utf8 | Self::Buffer => text.as_bytes().to_vec(),
            Self::Hex => hex::decode(text)
                .map_err(|e| StreamError::InvalidArgType(format!("invalid hex: {e}")))?,
            Self::Base64 => general_purpose::STANDARD
                .decode(text)
                .map_err(|e| StreamError::InvalidArgType(format!("invalid base64: {e}")))?,
            Self::Latin1 => text.chars().map(|c| c as u32 as u8).collect(),
        };
        Ok(Bytes::from(data))
    }

    /// Decode complete bytes into a string using this encoding.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 | Self::Buffer => String::from_utf8_lossy(bytes).into_owned(),
            Self::Hex => hex::encode(bytes),
            Self::Base64 => general_purpose::STANDARD.encode(bytes),
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of data moving through a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Binary data.
    Bytes(Bytes),
    /// Text data.
    Text(String),
    /// Arbitrary value, only meaningful in object mode.
    Value(serde_json::Value),
}

impl Chunk {
    /// The null chunk: end-of-data for `push`, an error for `write`.
    pub fn null() -> Self {
        Chunk::Value(serde_json::Value::Null)
    }

    /// Whether this is the null chunk.
    pub fn is_null(&self) -> bool {
        matches!(self, Chunk::Value(serde_json::Value::Null))
    }

    /// Length contribution in byte mode: bytes for binary data, characters
    /// for text. Values count as one unit.
    pub fn byte_mode_len(&self) -> usize {
        match self {
            Chunk::Bytes(b) => b.len(),
            Chunk::Text(s) => s.chars().count(),
            Chunk::Value(_) => 1,
        }
    }

    /// Length contribution for the given mode.
    pub fn len_in(&self, object_mode: bool) -> usize {
        if object_mode { 1 } else { self.byte_mode_len() }
    }

    /// Whether the chunk carries no data in byte mode.
    pub fn is_empty(&self) -> bool {
        match self {
            Chunk::Bytes(b) => b.is_empty(),
            Chunk::Text(s) => s.is_empty(),
            Chunk::Value(_) => false,
        }
    }

    /// Borrow the binary payload, if any.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Chunk::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow the text payload, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Chunk::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the value payload, if any.
    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Chunk::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Convert to bytes. Text is encoded with `encoding`; values are
    /// serialized as JSON.
    pub fn to_bytes(&self, encoding: Encoding) -> StreamResult<Bytes> {
        match self {
            Chunk::Bytes(b) => Ok(b.clone()),
            Chunk::Text(s) => encoding.encode(s),
            Chunk::Value(v) => Ok(Bytes::from(v.to_string())),
        }
    }

    /// Convert to text. Bytes are decoded with `encoding`.
    pub fn to_text(&self, encoding: Encoding) -> String {
        match self {
            Chunk::Bytes(b) => encoding.decode(b),
            Chunk::Text(s) => s.clone(),
            Chunk::Value(serde_json::Value::String(s)) => s.clone(),
            Chunk::Value(v) => v.to_string(),
        }
    }

    /// Convert to the host JSON representation.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Chunk::Text(s) => serde_json::Value::String(s.clone()),
            Chunk::Bytes(b) => serde_json::json!({
                "type": "Buffer",
                "data": b.as_ref()
            }),
            Chunk::Value(v) => v.clone(),
        }
    }

    /// Create from the host JSON representation.
    pub fn from_json(value: serde_json::Value) -> Self {
        if let Some(s) = value.as_str() {
            return Chunk::Text(s.to_string());
        }
        if let Some(obj) = value.as_object()
            && obj.get("type").and_then(|v| v.as_str()) == Some("Buffer")
            && let Some(data) = obj.get("data").and_then(|v| v.as_array())
        {
            let bytes: Vec<u8> = data
                .iter()
                .filter_map(|v| v.as_u64().map(|n| n as u8))
                .collect();
            return Chunk::Bytes(Bytes::from(bytes));
        }
        Chunk::Value(value)
    }
}

impl From<Bytes> for Chunk {
    fn from(value: Bytes) -> Self {
        Chunk::Bytes(value)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(value: Vec<u8>) -> Self {
        Chunk::Bytes(Bytes::from(value))
    }
}

impl From<&[u8]> for Chunk {
    fn from(value: &[u8]) -> Self {
        Chunk::Bytes(Bytes::copy_from_slice(value))
    }
}

impl<const N: usize> From<&[u8; N]> for Chunk {
    fn from(value: &[u8; N]) -> Self {
        Chunk::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<String> for Chunk {
    fn from(value: String) -> Self {
        Chunk::Text(value)
    }
}

impl From<&str> for Chunk {
    fn from(value: &str) -> Self {
        Chunk::Text(value.to_string())
    }
}

impl From<serde_json::Value> for Chunk {
    fn from(value: serde_json::Value) -> Self {
        Chunk::Value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_parse() {
        assert_eq!(Encoding::parse("UTF-8").unwrap(), Encoding::Utf8);
        assert_eq!(Encoding::parse("binary").unwrap(), Encoding::Latin1);
        assert!(matches!(
            Encoding::parse("ucs9"),
            Err(StreamError::InvalidEncoding(name)) if name == "ucs9"
        ));
    }

    #[test]
    fn test_encode_decode() {
        assert_eq!(Encoding::Hex.encode("6869").unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(Encoding::Base64.encode("aGVsbG8=").unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(Encoding::Hex.decode(b"hi"), "6869");
        assert_eq!(Encoding::Latin1.decode(&[0xe9]), "é");
        assert!(Encoding::Hex.encode("zz").is_err());
    }

    #[test]
    fn test_chunk_lengths() {
        assert_eq!(Chunk::from("héllo").byte_mode_len(), 5);
        assert_eq!(Chunk::from(vec![1u8, 2, 3]).len_in(false), 3);
        assert_eq!(Chunk::from(vec![1u8, 2, 3]).len_in(true), 1);
        assert!(Chunk::null().is_null());
        assert!(!Chunk::from(serde_json::json!(0)).is_null());
    }

    #[test]
    fn test_chunk_json_conversion() {
        let binary = Chunk::from(vec![1u8, 2, 3]);
        let json = binary.to_json();
        assert_eq!(json, serde_json::json!({"type": "Buffer", "data": [1, 2, 3]}));
        assert_eq!(Chunk::from_json(json), binary);

        assert_eq!(Chunk::from_json(serde_json::json!("hi")), Chunk::from("hi"));
        assert_eq!(
            Chunk::from_json(serde_json::json!({"a": 1})),
            Chunk::Value(serde_json::json!({"a": 1}))
        );
    }
}
