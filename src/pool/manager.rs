//! Uniform command facade over a single or sharded pool.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use serde::Deserialize;
use tracing::{error, info, warn};

use super::{ConnectionPool, PoolStats, PooledConnection, ShardedPool};
use crate::error::{CacheError, Result};
use crate::store::Connection;

/// Which pool layout backs a [`PoolManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    #[default]
    Single,
    Sharded,
}

enum Backend {
    Single(ConnectionPool),
    Sharded(ShardedPool),
}

/// Store commands executed on pooled connections.
///
/// Every command goes through [`PoolManager::execute`], so a leased
/// connection is always handed back before the command returns.
/// Failures are logged and collapse to "absent": `None`, `false` or `0`.
/// Use [`PoolManager::try_execute`] when the caller needs to tell a
/// missing key apart from a failed round trip.
pub struct PoolManager {
    backend: Backend,
}

impl PoolManager {
    /// Manager over a single-endpoint pool.
    pub fn single(pool: ConnectionPool) -> Self {
        Self {
            backend: Backend::Single(pool),
        }
    }

    /// Manager over a sharded pool.
    pub fn sharded(pool: ShardedPool) -> Self {
        Self {
            backend: Backend::Sharded(pool),
        }
    }

    pub fn kind(&self) -> PoolKind {
        match self.backend {
            Backend::Single(_) => PoolKind::Single,
            Backend::Sharded(_) => PoolKind::Sharded,
        }
    }

    /// Occupancy of the backing pool(s).
    pub fn stats(&self) -> PoolStats {
        match &self.backend {
            Backend::Single(pool) => pool.stats(),
            Backend::Sharded(pool) => pool.stats(),
        }
    }

    /// Close the backing pool(s).
    pub fn close(&self) {
        match &self.backend {
            Backend::Single(pool) => pool.close(),
            Backend::Sharded(pool) => pool.close(),
        }
    }

    fn checkout(&self, key: &[u8]) -> Result<PooledConnection> {
        match &self.backend {
            Backend::Single(pool) => pool.checkout(),
            Backend::Sharded(pool) => pool.checkout(key),
        }
    }

    /// Run `op` on a connection leased for `key`, keeping the failure.
    ///
    /// The connection is returned before this method returns, on success,
    /// on error and while unwinding from a panic in `op`. Transport errors
    /// and panics discard the connection instead of reusing it.
    pub fn try_execute<T, F>(&self, key: &[u8], op: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Connection) -> Result<T>,
    {
        let mut conn = self.checkout(key)?;
        let result = op(&mut *conn);
        if let Err(e) = &result
            && e.breaks_connection()
        {
            conn.mark_broken();
        }
        result
    }

    /// Run `op` on a connection leased for `key`.
    ///
    /// Checkout failures, errors returned by `op` and panics raised inside
    /// it are logged and turned into `None`.
    pub fn execute<T, F>(&self, key: &[u8], op: F) -> Option<T>
    where
        F: FnOnce(&mut dyn Connection) -> Result<T>,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| self.try_execute(key, op))) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(CacheError::PoolExhausted { waited_ms })) => {
                warn!(
                    "No connection for key {} after {}ms",
                    display_key(key),
                    waited_ms
                );
                None
            }
            Ok(Err(e)) => {
                error!("Store operation on key {} failed: {}", display_key(key), e);
                None
            }
            Err(payload) => {
                error!(
                    "Store operation on key {} panicked: {}",
                    display_key(key),
                    panic_message(payload.as_ref())
                );
                None
            }
        }
    }

    /// `GET`. `None` for a missing key or a failed call.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        info!("get {}", display_key(key));
        self.execute(key, |conn| conn.get(key)).flatten()
    }

    /// `SET`. Returns `true` once the store acknowledged the write.
    pub fn set(&self, key: &[u8], value: &[u8]) -> bool {
        info!("set {}", display_key(key));
        self.execute(key, |conn| conn.set(key, value)).is_some()
    }

    /// `SETEX`, or plain `SET` when `seconds <= 0`.
    pub fn set_with_expire(&self, key: &[u8], value: &[u8], seconds: i64) -> bool {
        if seconds <= 0 {
            return self.set(key, value);
        }
        info!("set {} (expires in {}s)", display_key(key), seconds);
        self.execute(key, |conn| conn.set_ex(key, value, seconds as u64))
            .is_some()
    }

    /// `DEL`. Returns the number of keys removed, 0 on failure.
    pub fn delete(&self, key: &[u8]) -> u64 {
        info!("delete {}", display_key(key));
        self.execute(key, |conn| conn.del(key)).unwrap_or(0)
    }

    /// Variadic `DEL`. Returns the number of keys removed.
    ///
    /// Keys are grouped by owning shard and each group is sent as one
    /// command. A failed group counts as 0 removed.
    pub fn delete_many(&self, keys: &[&[u8]]) -> u64 {
        if keys.is_empty() {
            return 0;
        }

        let mut groups: BTreeMap<usize, Vec<&[u8]>> = BTreeMap::new();
        for &key in keys {
            let shard = match &self.backend {
                Backend::Single(_) => 0,
                Backend::Sharded(pool) => pool.route_key(key),
            };
            groups.entry(shard).or_default().push(key);
        }

        info!("delete {} key(s) on {} shard(s)", keys.len(), groups.len());
        groups
            .values()
            .map(|group| self.execute(group[0], |conn| conn.del_many(group)).unwrap_or(0))
            .sum()
    }

    /// `EXPIRE`. No-op returning `false` when `seconds <= 0`.
    pub fn expire(&self, key: &[u8], seconds: i64) -> bool {
        if seconds <= 0 {
            return false;
        }
        self.execute(key, |conn| conn.expire(key, seconds as u64))
            .unwrap_or(false)
    }

    /// `INCRBY` with a non-negative delta.
    ///
    /// # Errors
    /// Returns [`CacheError::InvalidArgument`] when `delta < 0`.
    pub fn increment(&self, key: &[u8], delta: i64) -> Result<Option<i64>> {
        check_delta(delta)?;
        Ok(self.execute(key, |conn| conn.incr_by(key, delta)))
    }

    /// `DECRBY` with a non-negative delta.
    ///
    /// # Errors
    /// Returns [`CacheError::InvalidArgument`] when `delta < 0`.
    pub fn decrement(&self, key: &[u8], delta: i64) -> Result<Option<i64>> {
        check_delta(delta)?;
        Ok(self.execute(key, |conn| conn.decr_by(key, delta)))
    }

    /// `INCRBY` followed by `EXPIRE` on the same connection.
    ///
    /// The expiration is skipped when `seconds <= 0`; its failure does not
    /// hide the new counter value.
    ///
    /// # Errors
    /// Returns [`CacheError::InvalidArgument`] when `delta < 0`.
    pub fn increment_with_expire(&self, key: &[u8], delta: i64, seconds: i64) -> Result<Option<i64>> {
        check_delta(delta)?;
        Ok(self.execute(key, |conn| {
            let value = conn.incr_by(key, delta)?;
            if seconds > 0
                && let Err(e) = conn.expire(key, seconds as u64)
            {
                warn!("Failed to set expiration on {}: {}", display_key(key), e);
            }
            Ok(value)
        }))
    }

    /// `INCRBYFLOAT`.
    pub fn increment_by_float(&self, key: &[u8], delta: f64) -> Option<f64> {
        self.execute(key, |conn| conn.incr_by_float(key, delta))
    }

    /// `GETSET`. Returns the previous value.
    pub fn get_and_set(&self, key: &[u8], value: &[u8]) -> Option<Vec<u8>> {
        info!("getset {}", display_key(key));
        self.execute(key, |conn| conn.get_set(key, value)).flatten()
    }

    /// `APPEND`. Returns the new length.
    pub fn append(&self, key: &[u8], value: &[u8]) -> Option<u64> {
        self.execute(key, |conn| conn.append(key, value))
    }

    /// `STRLEN`.
    pub fn strlen(&self, key: &[u8]) -> Option<u64> {
        self.execute(key, |conn| conn.strlen(key))
    }

    /// `GETRANGE`. Offsets are inclusive; negative ones count from the end.
    pub fn get_range(&self, key: &[u8], start: i64, end: i64) -> Option<Vec<u8>> {
        self.execute(key, |conn| conn.get_range(key, start, end))
    }

    /// `SETRANGE`. Returns the length of the string after the write.
    pub fn set_range(&self, key: &[u8], offset: u64, value: &[u8]) -> Option<u64> {
        info!("setrange {} at {}", display_key(key), offset);
        self.execute(key, |conn| conn.set_range(key, offset, value))
    }

    /// `GETBIT`. `None` only when the call failed.
    pub fn get_bit(&self, key: &[u8], offset: u64) -> Option<bool> {
        self.execute(key, |conn| conn.get_bit(key, offset))
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("kind", &self.kind())
            .field("stats", &self.stats())
            .finish()
    }
}

fn check_delta(delta: i64) -> Result<()> {
    if delta < 0 {
        return Err(CacheError::InvalidArgument(format!(
            "counter delta must be non-negative, got {}",
            delta
        )));
    }
    Ok(())
}

fn display_key(key: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(key)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
