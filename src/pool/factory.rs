//! Construct-once provider of the process [`PoolManager`].
//!
//! The factory is built at start-up and handed to whoever needs the
//! manager. The first `get_instance` call builds the manager, concurrent
//! first callers all receive that same instance, and no second manager is
//! ever constructed. `set_instance` lets start-up code or tests install a
//! pre-built manager before first use.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use super::{ConnectionPool, PoolKind, PoolManager, ShardInfo, ShardedPool};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::store::{Connector, RedisConnector};

/// Builds a connector for an endpoint URL.
pub type ConnectorFactory = Arc<dyn Fn(&str, Duration) -> Result<Arc<dyn Connector>> + Send + Sync>;

/// Lazily builds and memoizes exactly one [`PoolManager`].
pub struct PoolManagerFactory {
    config: StoreConfig,
    connector_factory: ConnectorFactory,
    instance: OnceCell<Arc<PoolManager>>,
}

impl PoolManagerFactory {
    /// Factory connecting to Redis endpoints from `config`.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_connector_factory(
            config,
            Arc::new(
                |url: &str, timeout: Duration| -> Result<Arc<dyn Connector>> {
                    Ok(Arc::new(RedisConnector::new(url, timeout)?))
                },
            ),
        )
    }

    /// Factory using a custom transport.
    pub fn with_connector_factory(config: StoreConfig, connector_factory: ConnectorFactory) -> Self {
        Self {
            config,
            connector_factory,
            instance: OnceCell::new(),
        }
    }

    /// The shared manager, building it with `kind` on first use.
    ///
    /// Once built, later calls return that instance whatever `kind` they ask for.
    ///
    /// # Errors
    /// Returns an error if the manager could not be built; a later call
    /// retries the construction.
    pub fn get_instance(&self, kind: PoolKind) -> Result<Arc<PoolManager>> {
        let manager = self.instance.get_or_try_init(|| self.build(kind))?;
        if manager.kind() != kind {
            debug!(
                "Requested {:?} pool manager, returning existing {:?} instance",
                kind,
                manager.kind()
            );
        }
        Ok(Arc::clone(manager))
    }

    /// The configured kind, see [`PoolManagerFactory::get_instance`].
    pub fn get_default_instance(&self) -> Result<Arc<PoolManager>> {
        self.get_instance(self.config.kind)
    }

    /// Install a pre-built manager.
    ///
    /// Only the first writer wins: returns `false` and leaves the existing
    /// instance in place if one was already built or installed.
    pub fn set_instance(&self, manager: Arc<PoolManager>) -> bool {
        let installed = self.instance.set(manager).is_ok();
        if !installed {
            debug!("Pool manager already initialized, ignoring injected instance");
        }
        installed
    }

    /// Whether an instance exists yet.
    pub fn is_initialized(&self) -> bool {
        self.instance.get().is_some()
    }

    fn build(&self, kind: PoolKind) -> Result<Arc<PoolManager>> {
        let pool_config = self.config.pool.clone();
        let timeout = pool_config.connect_timeout;

        let manager = match kind {
            PoolKind::Single => {
                let connector = (self.connector_factory)(&self.config.url, timeout)?;
                info!("Creating single pool manager for {}", connector.endpoint());
                PoolManager::single(ConnectionPool::new(connector, pool_config))
            }
            PoolKind::Sharded => {
                let shards = self
                    .config
                    .shards
                    .iter()
                    .map(|shard| {
                        let connector = (self.connector_factory)(&shard.url, timeout)?;
                        Ok(ShardInfo::new(connector).weight(shard.weight))
                    })
                    .collect::<Result<Vec<_>>>()?;
                info!("Creating sharded pool manager over {} shard(s)", shards.len());
                PoolManager::sharded(ShardedPool::new(shards, pool_config)?)
            }
        };

        Ok(Arc::new(manager))
    }
}

impl std::fmt::Debug for PoolManagerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManagerFactory")
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
