//! Pool of per-shard pools with consistent-hash key routing.
//!
//! ## Routing
//!
//! Ketama-style ring. Shard `i` with weight `w` places `160 * w` virtual
//! nodes at `sha256("SHARD-{i}-NODE-{n}")[0..8]`, read as a big-endian
//! `u64`. A key hashes to `sha256(key)[0..8]` and routes to the first
//! virtual node at or after that point, wrapping around. The ring depends
//! only on shard order and weights, so routing is stable for the lifetime
//! of the table.

use std::collections::BTreeMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use super::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
use crate::error::{CacheError, Result};
use crate::store::Connector;

/// Virtual nodes per unit of shard weight.
const NODES_PER_WEIGHT: u32 = 160;

/// One shard endpoint with its ring weight.
#[derive(Clone)]
pub struct ShardInfo {
    pub connector: Arc<dyn Connector>,
    pub weight: u32,
}

impl ShardInfo {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            weight: 1,
        }
    }

    #[must_use]
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }
}

impl std::fmt::Debug for ShardInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardInfo")
            .field("endpoint", &self.connector.endpoint())
            .field("weight", &self.weight)
            .finish()
    }
}

/// Connection pools for an ordered set of shards.
#[derive(Clone)]
pub struct ShardedPool {
    shards: Arc<[ConnectionPool]>,
    ring: Arc<BTreeMap<u64, usize>>,
}

impl ShardedPool {
    /// Build one pool per shard, all sharing `config`.
    ///
    /// # Errors
    /// Returns [`CacheError::Config`] for an empty shard table.
    pub fn new(shards: Vec<ShardInfo>, config: PoolConfig) -> Result<Self> {
        if shards.is_empty() {
            return Err(CacheError::Config("shard table is empty".into()));
        }

        let mut ring = BTreeMap::new();
        for (index, shard) in shards.iter().enumerate() {
            for node in 0..NODES_PER_WEIGHT * shard.weight.max(1) {
                let point = ring_hash(format!("SHARD-{}-NODE-{}", index, node).as_bytes());
                ring.entry(point).or_insert(index);
            }
        }

        let pools: Vec<ConnectionPool> = shards
            .into_iter()
            .map(|shard| ConnectionPool::new(shard.connector, config.clone()))
            .collect();

        debug!(
            "Sharded pool ready: {} shard(s), {} ring node(s)",
            pools.len(),
            ring.len()
        );

        Ok(Self {
            shards: pools.into(),
            ring: Arc::new(ring),
        })
    }

    /// Index of the shard owning `key`.
    pub fn route_key(&self, key: &[u8]) -> usize {
        let point = ring_hash(key);
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map_or(0, |(_, index)| *index)
    }

    /// Pool serving `key`.
    pub fn shard_for(&self, key: &[u8]) -> &ConnectionPool {
        &self.shards[self.route_key(key)]
    }

    /// Lease a connection from the shard owning `key`.
    pub fn checkout(&self, key: &[u8]) -> Result<PooledConnection> {
        self.shard_for(key).checkout()
    }

    pub fn shards(&self) -> &[ConnectionPool] {
        &self.shards
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Occupancy summed over all shards.
    pub fn stats(&self) -> PoolStats {
        self.shards.iter().map(ConnectionPool::stats).fold(
            PoolStats::default(),
            |acc, s| PoolStats {
                active: acc.active + s.active,
                idle: acc.idle + s.idle,
                total: acc.total + s.total,
            },
        )
    }

    pub fn close(&self) {
        for pool in self.shards.iter() {
            pool.close();
        }
    }
}

impl std::fmt::Debug for ShardedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedPool")
            .field("shards", &self.shards)
            .field("ring_nodes", &self.ring.len())
            .finish()
    }
}

fn ring_hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}
