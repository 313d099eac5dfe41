//! Bounded connection pool for a single endpoint.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::PoolConfig;
use crate::error::{CacheError, Result};
use crate::store::{Connection, Connector};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Connections currently checked out.
    pub active: usize,
    /// Connections waiting in the idle set.
    pub idle: usize,
    /// Live connections, idle + active + being opened.
    pub total: usize,
}

struct PoolState {
    idle: VecDeque<Box<dyn Connection>>,
    active: usize,
    total: usize,
    closed: bool,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Thread-safe pool of connections to one endpoint.
///
/// Cloning is cheap and shares the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl ConnectionPool {
    /// Build a pool and open `min_idle` connections up front.
    ///
    /// Failures while warming up are logged; the pool still opens
    /// connections on demand later.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let config = config.normalized();
        let pool = Self {
            inner: Arc::new(Inner {
                connector,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: 0,
                    total: 0,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        };
        pool.warm_up();
        pool
    }

    fn warm_up(&self) {
        let wanted = self.inner.config.min_idle;
        for _ in 0..wanted {
            match self.inner.connector.connect() {
                Ok(conn) => {
                    let mut state = self.inner.state.lock();
                    state.total += 1;
                    state.idle.push_back(conn);
                }
                Err(e) => {
                    warn!(
                        "Failed to pre-open connection to {}: {}",
                        self.endpoint(),
                        e
                    );
                    break;
                }
            }
        }
        debug!(
            "Pool for {} ready with {} idle connection(s)",
            self.endpoint(),
            self.stats().idle
        );
    }

    /// Endpoint this pool connects to.
    pub fn endpoint(&self) -> &str {
        self.inner.connector.endpoint()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            active: state.active,
            idle: state.idle.len(),
            total: state.total,
        }
    }

    /// Lease a connection.
    ///
    /// Blocks up to `max_wait` when `max_total` connections are in use.
    ///
    /// # Errors
    /// - [`CacheError::PoolExhausted`] once the wait ceiling elapses
    /// - [`CacheError::PoolClosed`] after [`ConnectionPool::close`]
    /// - [`CacheError::Transport`] if a new connection cannot be opened
    ///   or validation fails twice
    pub fn checkout(&self) -> Result<PooledConnection> {
        // One wait budget covers the validation retry too.
        let started = Instant::now();
        let deadline = started + self.inner.config.max_wait;

        let conn = self.acquire(started, deadline)?;
        if !self.inner.config.test_on_borrow {
            return Ok(self.lease(conn));
        }

        // Validate, discard and retry once.
        match self.validate(conn) {
            Some(conn) => Ok(self.lease(conn)),
            None => {
                let conn = self.acquire(started, deadline)?;
                match self.validate(conn) {
                    Some(conn) => Ok(self.lease(conn)),
                    None => Err(CacheError::Transport(format!(
                        "connection to {} failed validation",
                        self.endpoint()
                    ))),
                }
            }
        }
    }

    /// Destroy idle connections and refuse further checkouts.
    ///
    /// Connections still leased are destroyed when they come back.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let dropped = state.idle.len();
        state.total -= dropped;
        state.idle.clear();
        self.inner.available.notify_all();
        debug!(
            "Closed pool for {} ({} idle connection(s) dropped)",
            self.endpoint(),
            dropped
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Take an idle connection or open a new one, counting it as active.
    fn acquire(&self, started: Instant, deadline: Instant) -> Result<Box<dyn Connection>> {
        let mut state = self.inner.state.lock();

        loop {
            if state.closed {
                return Err(CacheError::PoolClosed);
            }

            if let Some(conn) = state.idle.pop_front() {
                state.active += 1;
                return Ok(conn);
            }

            if state.total < self.inner.config.max_total {
                // Reserve the slot, then connect without holding the lock.
                state.total += 1;
                state.active += 1;
                drop(state);

                return match self.inner.connector.connect() {
                    Ok(conn) => Ok(conn),
                    Err(e) => {
                        let mut state = self.inner.state.lock();
                        state.total -= 1;
                        state.active -= 1;
                        self.inner.available.notify_one();
                        Err(e)
                    }
                };
            }

            if self
                .inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                // A slot may have been freed right at the deadline.
                if state.idle.is_empty() && state.total >= self.inner.config.max_total {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    warn!(
                        "Pool for {} exhausted after {}ms ({} in use)",
                        self.endpoint(),
                        waited_ms,
                        state.active
                    );
                    return Err(CacheError::PoolExhausted { waited_ms });
                }
            }
        }
    }

    fn validate(&self, mut conn: Box<dyn Connection>) -> Option<Box<dyn Connection>> {
        match conn.ping() {
            Ok(()) => Some(conn),
            Err(e) => {
                debug!("Discarding connection to {}: {}", self.endpoint(), e);
                self.release(conn, true);
                None
            }
        }
    }

    fn lease(&self, conn: Box<dyn Connection>) -> PooledConnection {
        PooledConnection {
            pool: self.clone(),
            conn: Some(conn),
            broken: false,
        }
    }

    /// Return a connection that is still usable.
    pub(crate) fn return_healthy(&self, conn: Box<dyn Connection>) {
        self.release(conn, false);
    }

    /// Return a connection that must be discarded. Frees its slot.
    pub(crate) fn return_broken(&self, conn: Box<dyn Connection>) {
        self.release(conn, true);
    }

    fn release(&self, conn: Box<dyn Connection>, broken: bool) {
        let mut state = self.inner.state.lock();
        state.active -= 1;

        let keep = !broken && !state.closed && state.idle.len() < self.inner.config.max_idle;
        if keep {
            state.idle.push_back(conn);
        } else {
            state.total -= 1;
            drop(conn);
        }
        self.inner.available.notify_one();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A leased connection.
///
/// Returned to its pool exactly once, when dropped. Call
/// [`PooledConnection::mark_broken`] after a transport failure so the
/// connection is discarded instead of reused.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Box<dyn Connection>>,
    broken: bool,
}

impl PooledConnection {
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Endpoint the connection belongs to.
    pub fn endpoint(&self) -> &str {
        self.pool.endpoint()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        // Only taken in Drop.
        self.conn.as_deref().expect("connection already returned")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.broken || std::thread::panicking() {
                self.pool.return_broken(conn);
            } else {
                self.pool.return_healthy(conn);
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("endpoint", &self.endpoint())
            .field("broken", &self.broken)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn pool(store: &MemoryStore, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(Arc::new(store.connector("memory://single")), config)
    }

    #[test]
    fn test_min_idle_opened_eagerly() {
        let store = MemoryStore::new();
        let pool = pool(&store, PoolConfig::with_max_total(4).max_idle(4).min_idle(2));

        assert_eq!(store.connections_opened(), 2);
        assert_eq!(
            pool.stats(),
            PoolStats {
                active: 0,
                idle: 2,
                total: 2
            }
        );
    }

    #[test]
    fn test_checkout_and_return_reuses_connection() {
        let store = MemoryStore::new();
        let pool = pool(&store, PoolConfig::with_max_total(2));

        {
            let mut conn = pool.checkout().unwrap();
            conn.set(b"k", b"v").unwrap();
            assert_eq!(pool.stats().active, 1);
        }
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 1);

        let _conn = pool.checkout().unwrap();
        assert_eq!(store.connections_opened(), 1);
    }

    #[test]
    fn test_broken_connection_is_discarded() {
        let store = MemoryStore::new();
        let pool = pool(&store, PoolConfig::with_max_total(2));

        {
            let mut conn = pool.checkout().unwrap();
            conn.mark_broken();
        }
        assert_eq!(
            pool.stats(),
            PoolStats {
                active: 0,
                idle: 0,
                total: 0
            }
        );
    }

    #[test]
    fn test_idle_above_max_idle_is_closed() {
        let store = MemoryStore::new();
        let pool = pool(&store, PoolConfig::with_max_total(3).max_idle(1));

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().total, 1);
    }

    #[test]
    fn test_exhausted_checkout_fails_after_max_wait() {
        let store = MemoryStore::new();
        let pool = pool(
            &store,
            PoolConfig::with_max_total(2).max_wait(Duration::from_millis(50)),
        );

        let _a = pool.checkout().unwrap();
        let _b = pool.checkout().unwrap();

        let started = Instant::now();
        let err = pool.checkout().unwrap_err();
        assert!(matches!(err, CacheError::PoolExhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.stats().active, 2);
    }

    #[test]
    fn test_waiter_wakes_when_connection_returns() {
        let store = MemoryStore::new();
        let pool = pool(
            &store,
            PoolConfig::with_max_total(1).max_wait(Duration::from_secs(5)),
        );
        let held = pool.checkout().unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| pool.checkout().map(|_| ()));
            std::thread::sleep(Duration::from_millis(20));
            drop(held);
            assert!(waiter.join().unwrap().is_ok());
        });
        assert_eq!(pool.stats().active, 0);
    }

    #[test]
    fn test_failed_validation_retries_once() {
        let store = MemoryStore::new();
        let pool = pool(&store, PoolConfig::with_max_total(2).min_idle(1));

        store.fail_next_pings(1);
        let conn = pool.checkout().unwrap();
        drop(conn);
        assert_eq!(store.connections_opened(), 2);

        store.fail_next_pings(2);
        let err = pool.checkout().unwrap_err();
        assert!(matches!(err, CacheError::Transport(_)));
        assert_eq!(pool.stats().active, 0);
    }

    #[test]
    fn test_validation_retry_shares_one_wait_budget() {
        let store = MemoryStore::new();
        let max_wait = Duration::from_millis(200);
        let pool = pool(&store, PoolConfig::with_max_total(1).max_wait(max_wait));
        let held = pool.checkout().unwrap();

        let waits: Vec<Duration> = std::thread::scope(|s| {
            let waiters: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        let started = Instant::now();
                        let result = pool.checkout();
                        let waited = started.elapsed();
                        if let Ok(conn) = result {
                            // Keep the slot busy past the other waiter's deadline.
                            std::thread::sleep(Duration::from_millis(400));
                            drop(conn);
                        }
                        waited
                    })
                })
                .collect();

            std::thread::sleep(Duration::from_millis(120));
            store.fail_next_pings(1);
            drop(held);

            waiters.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for waited in waits {
            assert!(
                waited < max_wait + Duration::from_millis(100),
                "checkout blocked for {:?}",
                waited
            );
        }
        assert_eq!(pool.stats().active, 0);
    }

    #[test]
    fn test_acquire_honours_caller_deadline() {
        let store = MemoryStore::new();
        let pool = pool(
            &store,
            PoolConfig::with_max_total(1).max_wait(Duration::from_secs(5)),
        );
        let _held = pool.checkout().unwrap();

        let now = Instant::now();
        let started = now.checked_sub(Duration::from_millis(150)).unwrap();
        let result = pool.acquire(started, now + Duration::from_millis(50));

        assert!(matches!(
            result,
            Err(CacheError::PoolExhausted { waited_ms }) if waited_ms >= 150
        ));
        assert!(now.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_connect_failure_frees_slot() {
        let store = MemoryStore::new();
        let pool = pool(&store, PoolConfig::with_max_total(1));

        store.set_unreachable(true);
        assert!(pool.checkout().is_err());
        store.set_unreachable(false);
        assert_eq!(pool.stats().total, 0);
        assert!(pool.checkout().is_ok());
    }

    #[test]
    fn test_closed_pool_refuses_checkout() {
        let store = MemoryStore::new();
        let pool = pool(&store, PoolConfig::with_max_total(2).max_idle(2).min_idle(2));

        let leased = pool.checkout().unwrap();
        pool.close();
        assert!(matches!(pool.checkout(), Err(CacheError::PoolClosed)));
        drop(leased);
        assert_eq!(pool.stats().total, 0);
    }
}
