//! shardcache - cache smoke check against the configured store.
//!
//! Builds the pool manager and cache manager exactly as an application
//! would at start-up, then writes, reads and evicts one entry through a
//! named cache.
//!
//! ## Architecture
//!
//! - `config` - Environment configuration
//! - `pool` - Connection pools and the pool manager factory
//! - `cache` - Named caches and their registry

use std::sync::Arc;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shardcache::{CacheManager, Config, NamedCache, PoolManagerFactory};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const SMOKE_CACHE: &str = "shardcache:smoke:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Probe {
    pid: u32,
    message: String,
}

fn main() -> anyhow::Result<()> {
    // Load .env file first (before anything else)
    dotenvy::dotenv().ok();

    // If RUST_LOG is not set, default to "info" level for our crate
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shardcache=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting shardcache...");

    let config = Config::from_env().context("loading configuration")?;
    info!("Configuration loaded successfully");
    info!("Store mode: {:?}", config.store.kind);

    let factory = PoolManagerFactory::new(config.store.clone());
    let pool = factory
        .get_default_instance()
        .context("building pool manager")?;

    let caches = CacheManager::new(Arc::clone(&pool), config.cache.clone());
    let cache: NamedCache<String, Probe> = caches.get_cache(SMOKE_CACHE)?;

    let key = format!("probe-{}", std::process::id());
    let probe = Probe {
        pid: std::process::id(),
        message: "hello from shardcache".to_string(),
    };

    if !cache.put_if_absent(&key, &probe) {
        pool.close();
        bail!("store did not acknowledge the probe write");
    }

    let read_back = cache.try_get(&key).context("reading probe back")?;
    cache.evict(&key);

    info!("Pool stats: {:?}", pool.stats());
    pool.close();

    match read_back {
        Some(found) if found == probe => {
            info!("Smoke check passed against {:?} store", config.store.kind);
            Ok(())
        }
        Some(found) => bail!("probe mismatch: wrote {:?}, read {:?}", probe, found),
        None => bail!("probe written but not found"),
    }
}
