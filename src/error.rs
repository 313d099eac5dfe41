//! Error types for the cache layer.

use thiserror::Error;

/// Result type alias using [`CacheError`].
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors raised by pools, codecs and caches.
///
/// Most of these are absorbed at the lowest layer that can still produce an
/// "absent" or "no-op" answer. `InvalidArgument` is the exception and always
/// reaches the caller.
#[derive(Error, Debug)]
pub enum CacheError {
    /// No connection became available before the checkout deadline.
    #[error("Connection pool exhausted after waiting {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// The pool was closed and hands out no more connections.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// A key or value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Programmer error, e.g. a negative counter delta.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection-level I/O failure. The connection is discarded.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The store rejected the command but the connection is still usable.
    #[error("Store error: {0}")]
    Store(String),

    /// Operation intentionally not supported by this layer.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A cache name was reused with different key/value types.
    #[error("Cache '{name}' already exists with types {existing}, requested {requested}")]
    TypeMismatch {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Whether the connection that produced this error must be discarded.
    pub fn breaks_connection(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            Self::Transport(err.to_string())
        } else {
            Self::Store(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_breaks_connection() {
        assert!(CacheError::Transport("reset".into()).breaks_connection());
        assert!(!CacheError::Store("WRONGTYPE".into()).breaks_connection());
        assert!(!CacheError::PoolExhausted { waited_ms: 10 }.breaks_connection());
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        assert!(matches!(CacheError::from(err), CacheError::Serialization(_)));
    }
}
