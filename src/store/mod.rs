//! Store transport contract.
//!
//! The pools only know how to open, validate and drive a [`Connection`].
//! Two transports are provided:
//! - [`RedisConnector`] - a real Redis endpoint via the `redis` crate
//! - [`MemoryStore`] - an in-process store used by tests and offline runs

mod memory;
mod redis;

pub use self::memory::{MemoryConnector, MemoryStore};
pub use self::redis::RedisConnector;

use crate::error::Result;

/// A live connection to one store endpoint.
///
/// Transport failures are reported as [`CacheError::Transport`](crate::CacheError::Transport);
/// commands the store refuses come back as [`CacheError::Store`](crate::CacheError::Store).
pub trait Connection: Send {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// `SETEX`: set with a time-to-live in seconds.
    fn set_ex(&mut self, key: &[u8], value: &[u8], seconds: u64) -> Result<()>;

    /// Returns the number of keys removed.
    fn del(&mut self, key: &[u8]) -> Result<u64>;

    /// Variadic `DEL` in one round trip.
    fn del_many(&mut self, keys: &[&[u8]]) -> Result<u64>;

    /// Returns `true` if the key existed and a timeout was set.
    fn expire(&mut self, key: &[u8], seconds: u64) -> Result<bool>;

    fn incr_by(&mut self, key: &[u8], delta: i64) -> Result<i64>;

    fn decr_by(&mut self, key: &[u8], delta: i64) -> Result<i64>;

    fn incr_by_float(&mut self, key: &[u8], delta: f64) -> Result<f64>;

    /// Atomically set and return the previous value.
    fn get_set(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Returns the length of the string after the append.
    fn append(&mut self, key: &[u8], value: &[u8]) -> Result<u64>;

    fn strlen(&mut self, key: &[u8]) -> Result<u64>;

    /// `GETRANGE`: inclusive byte range, negative offsets count from the end.
    fn get_range(&mut self, key: &[u8], start: i64, end: i64) -> Result<Vec<u8>>;

    /// `SETRANGE`: overwrite from `offset`, zero-padding a short value.
    /// Returns the length of the string afterwards.
    fn set_range(&mut self, key: &[u8], offset: u64, value: &[u8]) -> Result<u64>;

    /// `GETBIT`. Bits past the end of the string read as `false`.
    fn get_bit(&mut self, key: &[u8], offset: u64) -> Result<bool>;

    /// Liveness probe used by test-on-borrow.
    fn ping(&mut self) -> Result<()>;
}

/// Opens connections to a single endpoint.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Human readable endpoint, used in logs.
    fn endpoint(&self) -> &str;
}
