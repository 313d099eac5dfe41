//! Connection pool configuration.

use std::time::Duration;

/// Sizing and validation settings for a [`ConnectionPool`](super::ConnectionPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of live connections (idle + checked out).
    pub max_total: usize,

    /// Maximum number of idle connections kept around.
    /// Connections returned above this are closed.
    pub max_idle: usize,

    /// Connections opened eagerly when the pool is built.
    pub min_idle: usize,

    /// How long `checkout` blocks before failing with `PoolExhausted`.
    pub max_wait: Duration,

    /// Validate a connection with a liveness probe before handing it out.
    pub test_on_borrow: bool,

    /// Timeout for opening a new connection.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 50,
            max_idle: 10,
            min_idle: 0,
            max_wait: Duration::from_millis(5000),
            test_on_borrow: true,
            connect_timeout: Duration::from_millis(1000),
        }
    }
}

impl PoolConfig {
    /// Create a config with the given ceiling and defaults elsewhere.
    pub fn with_max_total(max_total: usize) -> Self {
        Self {
            max_total,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    #[must_use]
    pub fn min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    #[must_use]
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    #[must_use]
    pub fn test_on_borrow(mut self, enabled: bool) -> Self {
        self.test_on_borrow = enabled;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Clamp inconsistent settings: `max_total >= 1`, `max_idle <= max_total`,
    /// `min_idle <= max_idle`.
    pub fn normalized(mut self) -> Self {
        self.max_total = self.max_total.max(1);
        self.max_idle = self.max_idle.min(self.max_total);
        self.min_idle = self.min_idle.min(self.max_idle);
        self
    }
}
