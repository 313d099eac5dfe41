//! Cache manager - central registry of named caches.

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::NamedCache;
use crate::config::CacheSettings;
use crate::error::{CacheError, Result};
use crate::pool::PoolManager;
use crate::serializer::{JsonSerializer, PlainKeySerializer, Serializer};

/// Internal cache entry storing type-erased cache.
struct CacheEntry {
    cache: Box<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl CacheEntry {
    fn downcast<K: 'static, V: 'static>(&self, name: &str) -> Result<NamedCache<K, V>> {
        if self.type_id != TypeId::of::<NamedCache<K, V>>() {
            return Err(CacheError::TypeMismatch {
                name: name.to_string(),
                existing: self.type_name,
                requested: std::any::type_name::<NamedCache<K, V>>(),
            });
        }
        self.cache
            .downcast_ref::<NamedCache<K, V>>()
            .cloned()
            .ok_or_else(|| CacheError::TypeMismatch {
                name: name.to_string(),
                existing: self.type_name,
                requested: std::any::type_name::<NamedCache<K, V>>(),
            })
    }
}

/// Registry creating one [`NamedCache`] per name on first use.
///
/// Lookups of existing caches do not take the creation lock. The first
/// request for a name resolves its expiration (per-name override, else
/// the default) and that value sticks for the lifetime of the manager.
/// Caches are never removed.
///
/// ## Example
///
/// ```rust,ignore
/// let manager = CacheManager::new(pool, settings);
///
/// let sessions: NamedCache<String, Session> = manager.get_cache("sessions")?;
/// sessions.put(&token, &session);
/// ```
pub struct CacheManager {
    pool: Arc<PoolManager>,
    settings: RwLock<CacheSettings>,
    caches: DashMap<String, CacheEntry>,
    create_lock: Mutex<()>,
}

impl CacheManager {
    pub fn new(pool: Arc<PoolManager>, settings: CacheSettings) -> Self {
        info!(
            "Cache manager initialized (default expiration {}s, {} override(s))",
            settings.default_expiration,
            settings.expires.len()
        );
        Self {
            pool,
            settings: RwLock::new(settings),
            caches: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    /// Get or create a cache using the default codecs: plain keys and JSON values.
    ///
    /// # Errors
    /// - [`CacheError::InvalidArgument`] for an empty name
    /// - [`CacheError::TypeMismatch`] if `name` exists with other types
    pub fn get_cache<K, V>(&self, name: &str) -> Result<NamedCache<K, V>>
    where
        K: Serialize + DeserializeOwned + 'static,
        V: Serialize + DeserializeOwned + 'static,
    {
        self.get_cache_with(
            name,
            Arc::new(PlainKeySerializer::new()),
            Arc::new(JsonSerializer::new()),
        )
    }

    /// Get or create a cache with explicit codecs.
    ///
    /// The codecs are only used when this call creates the cache.
    pub fn get_cache_with<K, V>(
        &self,
        name: &str,
        key_serializer: Arc<dyn Serializer<K>>,
        value_serializer: Arc<dyn Serializer<V>>,
    ) -> Result<NamedCache<K, V>>
    where
        K: 'static,
        V: 'static,
    {
        if name.is_empty() {
            return Err(CacheError::InvalidArgument("cache name must not be empty".into()));
        }

        if let Some(entry) = self.caches.get(name) {
            return entry.downcast(name);
        }

        let _guard = self.create_lock.lock();

        // Another thread may have created it while we waited.
        if let Some(entry) = self.caches.get(name) {
            return entry.downcast(name);
        }

        let expiration = self.expiration_for(name);
        let cache = NamedCache::new(
            name,
            expiration,
            Arc::clone(&self.pool),
            key_serializer,
            value_serializer,
        );

        debug!("Creating cache: {} (expiration {}s)", name, expiration);

        self.caches.insert(
            name.to_string(),
            CacheEntry {
                cache: Box::new(cache.clone()),
                type_id: TypeId::of::<NamedCache<K, V>>(),
                type_name: std::any::type_name::<NamedCache<K, V>>(),
            },
        );

        Ok(cache)
    }

    /// Expiration a cache named `name` would get if created now.
    pub fn expiration_for(&self, name: &str) -> u64 {
        let settings = self.settings.read();
        settings
            .expires
            .get(name)
            .copied()
            .unwrap_or(settings.default_expiration)
    }

    /// Change the default expiration. Existing caches keep theirs.
    pub fn set_default_expiration(&self, seconds: u64) {
        self.settings.write().default_expiration = seconds;
    }

    /// Set a per-name override. An existing cache of that name keeps its value.
    pub fn set_expiration(&self, name: impl Into<String>, seconds: u64) {
        self.settings.write().expires.insert(name.into(), seconds);
    }

    /// Names of every cache created so far.
    pub fn cache_names(&self) -> HashSet<String> {
        self.caches.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Pool manager shared by all caches.
    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("cache_count", &self.caches.len())
            .field("cache_names", &self.cache_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::serializer::StringSerializer;
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    fn manager(store: &MemoryStore, default_expiration: u64) -> CacheManager {
        let pool = Arc::new(PoolManager::single(ConnectionPool::new(
            Arc::new(store.connector("memory://manager")),
            PoolConfig::with_max_total(8),
        )));
        CacheManager::new(
            pool,
            CacheSettings {
                default_expiration,
                expires: HashMap::from([("sessions".to_string(), 600)]),
            },
        )
    }

    #[test]
    fn test_expiration_override_then_default() {
        let store = MemoryStore::new();
        let manager = manager(&store, 60);

        let sessions: NamedCache<String, String> = manager.get_cache("sessions").unwrap();
        let users: NamedCache<String, String> = manager.get_cache("users").unwrap();
        assert_eq!(sessions.expiration(), 600);
        assert_eq!(users.expiration(), 60);
    }

    #[test]
    fn test_same_name_returns_memoized_instance() {
        let store = MemoryStore::new();
        let manager = manager(&store, 0);

        let a: NamedCache<String, String> = manager.get_cache("users").unwrap();
        let b: NamedCache<String, String> = manager.get_cache("users").unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_first_creation_wins_over_later_settings() {
        let store = MemoryStore::new();
        let manager = manager(&store, 0);

        let before: NamedCache<String, String> = manager.get_cache("users").unwrap();
        manager.set_expiration("users", 30);
        manager.set_default_expiration(90);
        let after: NamedCache<String, String> = manager.get_cache("users").unwrap();

        assert_eq!(before.expiration(), 0);
        assert_eq!(after.expiration(), 0);
        assert_eq!(manager.expiration_for("users"), 30);

        let fresh: NamedCache<String, String> = manager.get_cache("orders").unwrap();
        assert_eq!(fresh.expiration(), 90);
    }

    #[test]
    fn test_concurrent_get_cache_creates_once() {
        let store = MemoryStore::new();
        let manager = manager(&store, 0);

        let caches: Vec<NamedCache<String, String>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..32)
                .map(|_| s.spawn(|| manager.get_cache::<String, String>("sessions").unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(caches.iter().all(|c| c.ptr_eq(&caches[0])));
        assert_eq!(manager.cache_names(), HashSet::from(["sessions".to_string()]));
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let store = MemoryStore::new();
        let manager = manager(&store, 0);

        let _: NamedCache<String, String> = manager.get_cache("users").unwrap();
        let err = manager.get_cache::<String, u64>("users").unwrap_err();
        assert!(matches!(err, CacheError::TypeMismatch { .. }));
    }

    #[test]
    fn test_empty_name_rejected() {
        let store = MemoryStore::new();
        let manager = manager(&store, 0);
        let err = manager.get_cache::<String, String>("").unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_custom_codecs_and_names() {
        let store = MemoryStore::new();
        let manager = manager(&store, 0);

        let raw: NamedCache<String, String> = manager
            .get_cache_with("raw", Arc::new(StringSerializer), Arc::new(StringSerializer))
            .unwrap();
        raw.put(&"k".to_string(), &"plain".to_string());
        assert_eq!(store.raw_get(b"rawk"), Some(b"plain".to_vec()));

        let _: NamedCache<u64, String> = manager.get_cache("users").unwrap();
        assert_eq!(
            manager.cache_names(),
            HashSet::from(["raw".to_string(), "users".to_string()])
        );
        assert!(manager.contains("raw"));
    }

    #[test]
    fn test_sessions_scenario_end_to_end() {
        let store = MemoryStore::new();
        let manager = manager(&store, 0);
        let sessions: NamedCache<String, String> = manager.get_cache("sessions").unwrap();

        assert_eq!(sessions.get(&"missing".to_string()), None);
        sessions.put_if_absent(&"42".to_string(), &"payloadA".to_string());
        sessions.put_if_absent(&"42".to_string(), &"payloadB".to_string());
        assert_eq!(sessions.get(&"42".to_string()), Some("payloadB".to_string()));
        assert_eq!(store.expire_log(), vec![
            (b"sessions42".to_vec(), 600),
            (b"sessions42".to_vec(), 600),
        ]);
        assert_eq!(manager.pool().stats().active, 0);
    }
}
