//! Configuration module for shardcache.
//!
//! Loads configuration from environment variables (and `.env`), read once
//! at start-up.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::pool::{PoolConfig, PoolKind};

const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";

/// One shard endpoint and its ring weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardEndpoint {
    pub url: String,
    pub weight: u32,
}

impl ShardEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: 1,
        }
    }

    #[must_use]
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

impl FromStr for ShardEndpoint {
    type Err = CacheError;

    /// Parse `url` or `url#weight`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (url, weight) = match s.rsplit_once('#') {
            Some((url, weight)) => {
                let weight = weight.trim().parse::<u32>().ok().filter(|w| *w > 0).ok_or_else(|| {
                    CacheError::Config(format!("invalid shard weight in '{}'", s))
                })?;
                (url.trim(), weight)
            }
            None => (s, 1),
        };

        if url.is_empty() {
            return Err(CacheError::Config("empty shard url".into()));
        }

        Ok(Self::new(url).weight(weight))
    }
}

/// Where the store lives and how connections are pooled.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Pool layout built by the factory by default.
    pub kind: PoolKind,
    /// Endpoint for the single-pool layout.
    pub url: String,
    /// Ordered shard table for the sharded layout.
    pub shards: Vec<ShardEndpoint>,
    pub pool: PoolConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: PoolKind::Single,
            url: DEFAULT_STORE_URL.to_string(),
            shards: Vec::new(),
            pool: PoolConfig::default(),
        }
    }
}

/// Expiration policy handed to the cache manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSettings {
    /// Seconds applied to caches without an override. 0 disables expiration.
    pub default_expiration: u64,
    /// Per-cache expiration in seconds.
    pub expires: HashMap<String, u64>,
}

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub store: StoreConfig,
    pub cache: CacheSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Returns [`CacheError::Config`] for malformed values.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kind = match lookup("STORE_MODE")
            .map(|m| m.trim().to_lowercase())
            .as_deref()
        {
            None | Some("") | Some("single") => PoolKind::Single,
            Some("sharded") => PoolKind::Sharded,
            Some(other) => {
                return Err(CacheError::Config(format!(
                    "STORE_MODE must be 'single' or 'sharded', got '{}'",
                    other
                )));
            }
        };

        let url = lookup("STORE_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_STORE_URL.to_string());

        let shards = lookup("STORE_SHARDS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(ShardEndpoint::from_str)
            .collect::<Result<Vec<_>>>()?;

        if kind == PoolKind::Sharded && shards.is_empty() {
            return Err(CacheError::Config(
                "STORE_SHARDS must be set when STORE_MODE is sharded".into(),
            ));
        }

        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            max_total: parse_or(&lookup, "POOL_MAX_TOTAL", defaults.max_total)?,
            max_idle: parse_or(&lookup, "POOL_MAX_IDLE", defaults.max_idle)?,
            min_idle: parse_or(&lookup, "POOL_MIN_IDLE", defaults.min_idle)?,
            max_wait: Duration::from_millis(parse_or(
                &lookup,
                "POOL_MAX_WAIT_MS",
                defaults.max_wait.as_millis() as u64,
            )?),
            test_on_borrow: parse_or(&lookup, "POOL_TEST_ON_BORROW", defaults.test_on_borrow)?,
            connect_timeout: Duration::from_millis(parse_or(
                &lookup,
                "POOL_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout.as_millis() as u64,
            )?),
        };

        let cache = CacheSettings {
            default_expiration: parse_or(&lookup, "CACHE_DEFAULT_EXPIRATION", 0)?,
            expires: parse_expires(&lookup("CACHE_EXPIRES").unwrap_or_default())?,
        };

        Ok(Self {
            store: StoreConfig {
                kind,
                url,
                shards,
                pool,
            },
            cache,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name).map(|v| v.trim().to_string()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| CacheError::Config(format!("{} has invalid value '{}'", name, v))),
    }
}

/// Parse `name=seconds,name=seconds`.
fn parse_expires(raw: &str) -> Result<HashMap<String, u64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (name, seconds) = pair
                .split_once('=')
                .ok_or_else(|| CacheError::Config(format!("expected name=seconds, got '{}'", pair)))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(CacheError::Config(format!("missing cache name in '{}'", pair)));
            }
            let seconds = seconds.trim().parse::<u64>().map_err(|_| {
                CacheError::Config(format!("invalid expiration for cache '{}'", name))
            })?;
            Ok((name.to_string(), seconds))
        })
        .collect()
}
