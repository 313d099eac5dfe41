//! Namespaced cache over a shared pool manager.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{CacheError, Result};
use crate::pool::PoolManager;
use crate::serializer::Serializer;

struct Inner<K, V> {
    name: Arc<str>,
    expiration: u64,
    pool: Arc<PoolManager>,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
}

/// A named, typed view over the store.
///
/// Every storage key is the cache name followed by the encoded logical
/// key, so caches sharing one store never see each other's entries.
/// Writes are followed by an `EXPIRE` when the cache has a non-zero
/// expiration.
///
/// Codec and store failures never reach the caller: reads degrade to
/// `None` and writes to no-ops, each with a log line. [`NamedCache::try_get`]
/// is available when absence and failure must be told apart.
///
/// Cloning is cheap and shares the same cache.
pub struct NamedCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

// Manual Clone implementation that doesn't require K: Clone, V: Clone
impl<K, V> Clone for NamedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> NamedCache<K, V> {
    /// Create a cache named `name` with `expiration` seconds (0 = none).
    pub fn new(
        name: impl Into<Arc<str>>,
        expiration: u64,
        pool: Arc<PoolManager>,
        key_serializer: Arc<dyn Serializer<K>>,
        value_serializer: Arc<dyn Serializer<V>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                expiration,
                pool,
                key_serializer,
                value_serializer,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Expiration applied after each write, in seconds.
    pub fn expiration(&self) -> u64 {
        self.inner.expiration
    }

    /// The pool manager backing this cache.
    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.inner.pool
    }

    /// Whether both handles point at the same cache instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Storage key for `key`: name bytes followed by the encoded key.
    pub fn storage_key(&self, key: &K) -> Result<Vec<u8>> {
        let encoded = self.inner.key_serializer.serialize(key)?;
        let mut storage_key = Vec::with_capacity(self.inner.name.len() + encoded.len());
        storage_key.extend_from_slice(self.inner.name.as_bytes());
        storage_key.extend_from_slice(&encoded);
        Ok(storage_key)
    }

    /// Look up a value.
    ///
    /// Missing keys, store failures and undecodable payloads all read as `None`.
    pub fn get(&self, key: &K) -> Option<V> {
        let storage_key = self.key_or_log(key, "get")?;
        info!(
            "get from cache '{}' by key: {}",
            self.name(),
            String::from_utf8_lossy(&storage_key)
        );

        let bytes = self.inner.pool.get(&storage_key)?;
        match self.inner.value_serializer.deserialize(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    "Cache '{}' could not decode value for {}: {}",
                    self.name(),
                    String::from_utf8_lossy(&storage_key),
                    e
                );
                None
            }
        }
    }

    /// Look up a value, keeping failures visible.
    ///
    /// `Ok(None)` means the key is not in the store.
    pub fn try_get(&self, key: &K) -> Result<Option<V>> {
        let storage_key = self.storage_key(key)?;
        let bytes = self
            .inner
            .pool
            .try_execute(&storage_key, |conn| conn.get(&storage_key))?;
        bytes
            .map(|b| self.inner.value_serializer.deserialize(&b))
            .transpose()
    }

    /// Store a value, overwriting any existing one.
    pub fn put(&self, key: &K, value: &V) {
        self.put_if_absent(key, value);
    }

    /// Store a value and apply the cache expiration.
    ///
    /// The store always overwrites, so this is last-write-wins despite the
    /// name. Returns `true` once the write was acknowledged. The expiration
    /// is best-effort: its failure does not undo the write.
    pub fn put_if_absent(&self, key: &K, value: &V) -> bool {
        let Some(storage_key) = self.key_or_log(key, "put") else {
            return false;
        };
        info!(
            "put to cache '{}' with key: {}",
            self.name(),
            String::from_utf8_lossy(&storage_key)
        );

        let payload = match self.inner.value_serializer.serialize(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cache '{}' could not encode value: {}", self.name(), e);
                return false;
            }
        };

        if !self.inner.pool.set(&storage_key, &payload) {
            return false;
        }

        if self.inner.expiration > 0 {
            let seconds = i64::try_from(self.inner.expiration).unwrap_or(i64::MAX);
            if !self.inner.pool.expire(&storage_key, seconds) {
                warn!(
                    "Cache '{}' wrote {} but could not set its expiration",
                    self.name(),
                    String::from_utf8_lossy(&storage_key)
                );
            }
        }
        true
    }

    /// Return the cached value, or compute, store and return it.
    pub fn get_with<F>(&self, key: &K, loader: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = loader();
        self.put(key, &value);
        value
    }

    /// Remove a key. A key that cannot be encoded makes this a no-op.
    pub fn evict(&self, key: &K) {
        let Some(storage_key) = self.key_or_log(key, "evict") else {
            return;
        };
        info!(
            "delete from cache '{}' by key: {}",
            self.name(),
            String::from_utf8_lossy(&storage_key)
        );
        self.inner.pool.delete(&storage_key);
    }

    /// Not supported: the keyspace is shared with other caches.
    ///
    /// # Errors
    /// Always returns [`CacheError::Unsupported`].
    pub fn clear(&self) -> Result<()> {
        Err(CacheError::Unsupported(
            "clear on a cache sharing its keyspace with other caches",
        ))
    }

    fn key_or_log(&self, key: &K, op: &str) -> Option<Vec<u8>> {
        match self.storage_key(key) {
            Ok(storage_key) => Some(storage_key),
            Err(e) => {
                warn!("Cache '{}' could not encode key for {}: {}", self.name(), op, e);
                None
            }
        }
    }
}

impl<K, V> std::fmt::Debug for NamedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedCache")
            .field("name", &self.inner.name)
            .field("expiration", &self.inner.expiration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::serializer::{JsonSerializer, PlainKeySerializer, StringSerializer};
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn pool(store: &MemoryStore) -> Arc<PoolManager> {
        Arc::new(PoolManager::single(ConnectionPool::new(
            Arc::new(store.connector("memory://cache")),
            PoolConfig::with_max_total(4),
        )))
    }

    fn cache(store: &MemoryStore, name: &str, expiration: u64) -> NamedCache<String, String> {
        NamedCache::new(
            name,
            expiration,
            pool(store),
            Arc::new(StringSerializer),
            Arc::new(JsonSerializer::new()),
        )
    }

    /// Key codec that refuses one key.
    struct Picky;

    impl Serializer<String> for Picky {
        fn serialize(&self, value: &String) -> Result<Vec<u8>> {
            if value == "bad" {
                return Err(CacheError::Serialization("refused".into()));
            }
            Ok(value.as_bytes().to_vec())
        }

        fn deserialize(&self, bytes: &[u8]) -> Result<String> {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
    }

    #[test]
    fn test_missing_key_reads_absent() {
        let store = MemoryStore::new();
        let sessions = cache(&store, "sessions", 0);
        assert_eq!(sessions.get(&"missing".to_string()), None);
        assert!(matches!(sessions.try_get(&"missing".to_string()), Ok(None)));
    }

    #[test]
    fn test_storage_key_is_name_then_key() {
        let store = MemoryStore::new();
        let sessions = cache(&store, "sessions", 0);

        sessions.put(&"42".to_string(), &"payloadA".to_string());
        assert_eq!(
            sessions.storage_key(&"42".to_string()).unwrap(),
            b"sessions42"
        );
        assert_eq!(store.raw_get(b"sessions42"), Some(b"\"payloadA\"".to_vec()));
    }

    #[test]
    fn test_last_write_wins() {
        let store = MemoryStore::new();
        let sessions = cache(&store, "sessions", 0);
        let key = "42".to_string();

        assert!(sessions.put_if_absent(&key, &"payloadA".to_string()));
        assert!(sessions.put_if_absent(&key, &"payloadB".to_string()));
        assert_eq!(sessions.get(&key), Some("payloadB".to_string()));
    }

    #[test]
    fn test_expire_issued_with_configured_seconds() {
        let store = MemoryStore::new();
        let sessions = cache(&store, "sessions", 600);
        sessions.put(&"42".to_string(), &"v".to_string());
        assert_eq!(store.expire_log(), vec![(b"sessions42".to_vec(), 600)]);
        assert!(store.has_ttl(b"sessions42"));
    }

    #[test]
    fn test_no_expire_when_expiration_is_zero() {
        let store = MemoryStore::new();
        let sessions = cache(&store, "sessions", 0);
        sessions.put(&"42".to_string(), &"v".to_string());
        assert!(store.expire_log().is_empty());
        assert!(!store.has_ttl(b"sessions42"));
    }

    #[test]
    fn test_failed_write_skips_expire() {
        let store = MemoryStore::new();
        let sessions = cache(&store, "sessions", 60);
        store.set_unreachable(true);
        assert!(!sessions.put_if_absent(&"42".to_string(), &"v".to_string()));
        store.set_unreachable(false);
        assert!(store.expire_log().is_empty());
    }

    #[test]
    fn test_undecodable_value_reads_absent() {
        let store = MemoryStore::new();
        let counts: NamedCache<String, u64> = NamedCache::new(
            "counts",
            0,
            pool(&store),
            Arc::new(StringSerializer),
            Arc::new(JsonSerializer::new()),
        );
        counts.pool().set(b"countsx", b"not-a-number");

        assert_eq!(counts.get(&"x".to_string()), None);
        assert!(matches!(
            counts.try_get(&"x".to_string()),
            Err(CacheError::Serialization(_))
        ));
    }

    #[test]
    fn test_key_codec_failure_is_a_no_op() {
        let store = MemoryStore::new();
        let picky: NamedCache<String, String> = NamedCache::new(
            "picky",
            60,
            pool(&store),
            Arc::new(Picky),
            Arc::new(JsonSerializer::new()),
        );
        let bad = "bad".to_string();

        assert!(!picky.put_if_absent(&bad, &"v".to_string()));
        assert_eq!(picky.get(&bad), None);
        picky.evict(&bad);
        assert!(store.is_empty());
    }

    #[test]
    fn test_evict_removes_entry() {
        let store = MemoryStore::new();
        let sessions = cache(&store, "sessions", 0);
        let key = "42".to_string();

        sessions.put(&key, &"v".to_string());
        sessions.evict(&key);
        assert_eq!(sessions.get(&key), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_is_unsupported() {
        let store = MemoryStore::new();
        let sessions = cache(&store, "sessions", 0);
        assert!(matches!(sessions.clear(), Err(CacheError::Unsupported(_))));
    }

    #[test]
    fn test_get_with_loads_once() {
        let store = MemoryStore::new();
        let sessions = cache(&store, "sessions", 0);
        let key = "42".to_string();

        let first = sessions.get_with(&key, || "loaded".to_string());
        let second = sessions.get_with(&key, || panic!("loader must not run twice"));
        assert_eq!(first, "loaded");
        assert_eq!(second, "loaded");
    }

    #[test]
    fn test_same_logical_key_isolated_between_caches() {
        let store = MemoryStore::new();
        let pm = pool(&store);
        let users: NamedCache<u64, String> = NamedCache::new(
            "users",
            0,
            pm.clone(),
            Arc::new(PlainKeySerializer::new()),
            Arc::new(JsonSerializer::new()),
        );
        let orders: NamedCache<u64, String> = NamedCache::new(
            "orders",
            0,
            pm,
            Arc::new(PlainKeySerializer::new()),
            Arc::new(JsonSerializer::new()),
        );

        users.put(&1, &"alice".to_string());
        orders.put(&1, &"order-1".to_string());
        assert_eq!(users.get(&1), Some("alice".to_string()));
        assert_eq!(orders.get(&1), Some("order-1".to_string()));
    }

    proptest! {
        #[test]
        fn prop_distinct_names_give_distinct_storage_keys(
            n1 in "[a-z:]{1,12}",
            n2 in "[a-z:]{1,12}",
            key in "\\PC{0,24}",
        ) {
            prop_assume!(n1 != n2);
            let store = MemoryStore::new();
            let a = cache(&store, &n1, 0);
            let b = cache(&store, &n2, 0);
            prop_assert_ne!(a.storage_key(&key).unwrap(), b.storage_key(&key).unwrap());
        }
    }
}
