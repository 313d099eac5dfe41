//! Byte codecs for cache keys and values.
//!
//! A [`NamedCache`](crate::cache::NamedCache) holds two independent codecs:
//! one turning logical keys into the bytes appended to the cache name, and
//! one turning values into the bytes stored under that key.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CacheError, Result};

/// Bidirectional byte codec.
pub trait Serializer<T>: Send + Sync {
    /// Encode a logical value into bytes.
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode bytes produced by [`Serializer::serialize`].
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// UTF-8 codec for `String`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

/// Pass-through codec for raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// JSON codec for any serde type. Default value codec.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSerializer")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Default key codec.
///
/// String keys are written verbatim (`"42"` becomes `42`), every other
/// serde type as compact JSON. Keeps storage keys readable in the store
/// while still accepting numeric or composite keys.
pub struct PlainKeySerializer<K> {
    _marker: PhantomData<fn() -> K>,
}

impl<K> PlainKeySerializer<K> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K> Default for PlainKeySerializer<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for PlainKeySerializer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainKeySerializer")
            .field("type", &std::any::type_name::<K>())
            .finish()
    }
}

impl<K> Serializer<K> for PlainKeySerializer<K>
where
    K: Serialize + DeserializeOwned,
{
    fn serialize(&self, key: &K) -> Result<Vec<u8>> {
        match serde_json::to_value(key)? {
            serde_json::Value::String(s) => Ok(s.into_bytes()),
            other => Ok(serde_json::to_vec(&other)?),
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<K> {
        // String keys are stored as bare text, so they are tried first and
        // come back exactly as written, quotes included.
        if let Ok(text) = std::str::from_utf8(bytes)
            && let Ok(key) = serde_json::from_value(serde_json::Value::String(text.to_string()))
        {
            return Ok(key);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Session {
        user_id: u64,
        token: String,
    }

    #[test]
    fn test_string_serializer_rejects_invalid_utf8() {
        let err = StringSerializer.deserialize(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn test_json_serializer_struct() {
        let codec = JsonSerializer::<Session>::new();
        let session = Session {
            user_id: 7,
            token: "abc".into(),
        };
        let bytes = codec.serialize(&session).unwrap();
        assert_eq!(codec.deserialize(&bytes).unwrap(), session);
        assert!(codec.deserialize(b"{\"user_id\":").is_err());
    }

    #[test]
    fn test_plain_key_string_is_verbatim() {
        let codec = PlainKeySerializer::<String>::new();
        assert_eq!(codec.serialize(&"42".to_string()).unwrap(), b"42");
        assert_eq!(codec.deserialize(b"user:1").unwrap(), "user:1");
    }

    #[test]
    fn test_plain_key_string_that_looks_like_json() {
        let codec = PlainKeySerializer::<String>::new();
        for key in ["\"x\"", "42", "[1,2]", "{\"a\":1}", "null", ""] {
            let bytes = codec.serialize(&key.to_string()).unwrap();
            assert_eq!(bytes, key.as_bytes());
            assert_eq!(codec.deserialize(&bytes).unwrap(), key);
        }
        assert!(codec.deserialize(&[0xff]).is_err());
    }

    #[test]
    fn test_plain_key_numbers_and_tuples() {
        let codec = PlainKeySerializer::<i64>::new();
        assert_eq!(codec.serialize(&-5).unwrap(), b"-5");
        assert_eq!(codec.deserialize(b"-5").unwrap(), -5);

        let codec = PlainKeySerializer::<(i64, u64)>::new();
        assert_eq!(codec.serialize(&(1, 2)).unwrap(), b"[1,2]");
        assert_eq!(codec.deserialize(b"[1,2]").unwrap(), (1, 2));
    }
}
