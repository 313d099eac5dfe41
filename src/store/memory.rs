//! In-process store speaking the same command set as Redis.
//!
//! Cloning a [`MemoryStore`] shares the same keyspace. Failure switches let
//! tests exercise broken-connection and failed-validation paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Connection, Connector};
use crate::error::{CacheError, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Shared {
    data: Mutex<HashMap<Vec<u8>, Entry>>,
    expire_log: Mutex<Vec<(Vec<u8>, u64)>>,
    unreachable: AtomicBool,
    failing_pings: AtomicUsize,
    connections_opened: AtomicU64,
}

/// Shared in-memory keyspace.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector handing out connections to this store.
    pub fn connector(&self, endpoint: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
            endpoint: endpoint.into(),
        }
    }

    /// Read a raw key, ignoring expired entries.
    pub fn raw_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let now = Instant::now();
        self.shared
            .data
            .lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    /// Whether a raw key carries a time-to-live.
    pub fn has_ttl(&self, key: &[u8]) -> bool {
        self.shared
            .data
            .lock()
            .get(key)
            .is_some_and(|e| e.expires_at.is_some())
    }

    /// Every `EXPIRE` received, in arrival order.
    pub fn expire_log(&self) -> Vec<(Vec<u8>, u64)> {
        self.shared.expire_log.lock().clone()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shared
            .data
            .lock()
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total connections opened against this store.
    pub fn connections_opened(&self) -> u64 {
        self.shared.connections_opened.load(Ordering::SeqCst)
    }

    /// Make every connect and command fail with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `count` liveness probes.
    pub fn fail_next_pings(&self, count: usize) {
        self.shared.failing_pings.store(count, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.shared.unreachable.load(Ordering::SeqCst) {
            return Err(CacheError::Transport("connection reset by peer".into()));
        }
        Ok(())
    }

    fn read_integer(entry: Option<&Entry>) -> Result<i64> {
        match entry {
            None => Ok(0),
            Some(e) => std::str::from_utf8(&e.value)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    CacheError::Store("value is not an integer or out of range".into())
                }),
        }
    }

    fn add(&self, key: &[u8], delta: i64) -> Result<i64> {
        let now = Instant::now();
        let mut data = self.shared.data.lock();
        let live = data.get(key).filter(|e| e.is_live(now));
        let current = Self::read_integer(live)?;
        let expires_at = live.and_then(|e| e.expires_at);
        let next = current
            .checked_add(delta)
            .ok_or_else(|| CacheError::Store("increment or decrement would overflow".into()))?;
        data.insert(
            key.to_vec(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }
}

/// Largest string `SETRANGE` may produce, matching Redis' 512MB limit.
const MAX_STRING_LEN: u64 = 512 * 1024 * 1024;

/// Connector for a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
    endpoint: String,
}

impl Connector for MemoryConnector {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        self.store.check_reachable()?;
        self.store
            .shared
            .connections_opened
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            store: self.store.clone(),
        }))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

struct MemoryConnection {
    store: MemoryStore,
}

impl MemoryConnection {
    fn write(&self, key: &[u8], value: Vec<u8>, ttl: Option<Duration>) {
        self.store.shared.data.lock().insert(
            key.to_vec(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }
}

impl Connection for MemoryConnection {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.check_reachable()?;
        Ok(self.store.raw_get(key))
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store.check_reachable()?;
        self.write(key, value.to_vec(), None);
        Ok(())
    }

    fn set_ex(&mut self, key: &[u8], value: &[u8], seconds: u64) -> Result<()> {
        self.store.check_reachable()?;
        if seconds == 0 {
            return Err(CacheError::Store("invalid expire time in 'setex' command".into()));
        }
        self.write(key, value.to_vec(), Some(Duration::from_secs(seconds)));
        Ok(())
    }

    fn del(&mut self, key: &[u8]) -> Result<u64> {
        self.store.check_reachable()?;
        let now = Instant::now();
        let removed = self.store.shared.data.lock().remove(key);
        Ok(u64::from(removed.is_some_and(|e| e.is_live(now))))
    }

    fn del_many(&mut self, keys: &[&[u8]]) -> Result<u64> {
        self.store.check_reachable()?;
        let now = Instant::now();
        let mut data = self.store.shared.data.lock();
        Ok(keys
            .iter()
            .filter_map(|key| data.remove(*key))
            .filter(|e| e.is_live(now))
            .count() as u64)
    }

    fn expire(&mut self, key: &[u8], seconds: u64) -> Result<bool> {
        self.store.check_reachable()?;
        self.store
            .shared
            .expire_log
            .lock()
            .push((key.to_vec(), seconds));

        let now = Instant::now();
        let mut data = self.store.shared.data.lock();
        match data.get_mut(key).filter(|e| e.is_live(now)) {
            Some(entry) => {
                entry.expires_at = Some(now + Duration::from_secs(seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn incr_by(&mut self, key: &[u8], delta: i64) -> Result<i64> {
        self.store.check_reachable()?;
        self.store.add(key, delta)
    }

    fn decr_by(&mut self, key: &[u8], delta: i64) -> Result<i64> {
        self.store.check_reachable()?;
        let delta = delta
            .checked_neg()
            .ok_or_else(|| CacheError::Store("decrement would overflow".into()))?;
        self.store.add(key, delta)
    }

    fn incr_by_float(&mut self, key: &[u8], delta: f64) -> Result<f64> {
        self.store.check_reachable()?;
        let now = Instant::now();
        let mut data = self.store.shared.data.lock();
        let live = data.get(key).filter(|e| e.is_live(now));
        let current = match live {
            None => 0.0,
            Some(e) => std::str::from_utf8(&e.value)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| CacheError::Store("value is not a valid float".into()))?,
        };
        let expires_at = live.and_then(|e| e.expires_at);
        let next = current + delta;
        data.insert(
            key.to_vec(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }

    fn get_set(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.check_reachable()?;
        let now = Instant::now();
        let previous = self.store.shared.data.lock().insert(
            key.to_vec(),
            Entry {
                value: value.to_vec(),
                expires_at: None,
            },
        );
        Ok(previous.filter(|e| e.is_live(now)).map(|e| e.value))
    }

    fn append(&mut self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.store.check_reachable()?;
        let now = Instant::now();
        let mut data = self.store.shared.data.lock();
        let entry = data.entry(key.to_vec()).or_insert(Entry {
            value: Vec::new(),
            expires_at: None,
        });
        if !entry.is_live(now) {
            entry.value.clear();
            entry.expires_at = None;
        }
        entry.value.extend_from_slice(value);
        Ok(entry.value.len() as u64)
    }

    fn strlen(&mut self, key: &[u8]) -> Result<u64> {
        self.store.check_reachable()?;
        Ok(self.store.raw_get(key).map_or(0, |v| v.len() as u64))
    }

    fn get_range(&mut self, key: &[u8], start: i64, end: i64) -> Result<Vec<u8>> {
        self.store.check_reachable()?;
        let value = self.store.raw_get(key).unwrap_or_default();
        let len = value.len() as i64;
        if len == 0 {
            return Ok(Vec::new());
        }

        let resolve = |i: i64| if i < 0 { (len + i).max(0) } else { i };
        let start = resolve(start);
        let end = resolve(end).min(len - 1);
        if start > end {
            return Ok(Vec::new());
        }
        Ok(value[start as usize..=end as usize].to_vec())
    }

    fn set_range(&mut self, key: &[u8], offset: u64, value: &[u8]) -> Result<u64> {
        self.store.check_reachable()?;
        let now = Instant::now();
        let mut data = self.store.shared.data.lock();
        if data.get(key).is_some_and(|e| !e.is_live(now)) {
            data.remove(key);
        }

        if value.is_empty() {
            return Ok(data.get(key).map_or(0, |e| e.value.len() as u64));
        }
        if offset
            .checked_add(value.len() as u64)
            .is_none_or(|end| end > MAX_STRING_LEN)
        {
            return Err(CacheError::Store("string exceeds maximum allowed size".into()));
        }

        let entry = data.entry(key.to_vec()).or_insert(Entry {
            value: Vec::new(),
            expires_at: None,
        });
        let offset = offset as usize;
        let end = offset + value.len();
        if entry.value.len() < end {
            entry.value.resize(end, 0);
        }
        entry.value[offset..end].copy_from_slice(value);
        Ok(entry.value.len() as u64)
    }

    fn get_bit(&mut self, key: &[u8], offset: u64) -> Result<bool> {
        self.store.check_reachable()?;
        let value = self.store.raw_get(key).unwrap_or_default();
        let byte = (offset / 8) as usize;
        let mask = 1u8 << (7 - offset % 8);
        Ok(value.get(byte).is_some_and(|b| b & mask != 0))
    }

    fn ping(&mut self) -> Result<()> {
        self.store.check_reachable()?;
        let failing = &self.store.shared.failing_pings;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CacheError::Transport("ping timed out".into()));
        }
        Ok(())
    }
}
