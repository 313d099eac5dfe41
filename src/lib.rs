//! shardcache - namespaced caches over a pooled, optionally sharded store.
//!
//! ## Architecture
//!
//! - `serializer` - Key and value codecs
//! - `store` - Transport contract plus Redis and in-memory implementations
//! - `pool` - Connection pools, shard routing, pool manager and its factory
//! - `cache` - Named caches and the cache manager registry
//! - `config` - Environment configuration

pub mod cache;
pub mod config;
pub mod error;
pub mod pool;
pub mod serializer;
pub mod store;

pub use cache::{CacheManager, NamedCache};
pub use config::{CacheSettings, Config, ShardEndpoint, StoreConfig};
pub use error::{CacheError, Result};
pub use pool::{
    ConnectionPool, PoolConfig, PoolKind, PoolManager, PoolManagerFactory, PoolStats, ShardInfo,
    ShardedPool,
};
pub use serializer::{
    BytesSerializer, JsonSerializer, PlainKeySerializer, Serializer, StringSerializer,
};
pub use store::{Connection, Connector, MemoryStore, RedisConnector};
