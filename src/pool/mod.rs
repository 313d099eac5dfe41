//! Connection pooling.
//!
//! - `ConnectionPool` - bounded pool for one endpoint
//! - `ShardedPool` - one pool per shard, keys routed over a hash ring
//! - `PoolManager` - store commands on top of either, with scoped execution
//! - `PoolManagerFactory` - builds the shared manager exactly once

mod config;
mod factory;
mod manager;
mod sharded;
mod single;

pub use config::PoolConfig;
pub use factory::{ConnectorFactory, PoolManagerFactory};
pub use manager::{PoolKind, PoolManager};
pub use sharded::{ShardInfo, ShardedPool};
pub use single::{ConnectionPool, PoolStats, PooledConnection};
