//! Cache module - namespaced caches over a pooled store.
//!
//! This module provides a registry-based caching system that lets feature
//! code obtain its own named cache without worrying about key collisions
//! in the shared store.
//!
//! ## Architecture
//!
//! - `CacheManager` - Central registry creating one cache per name
//! - `NamedCache` - Typed cache prefixing every key with its name
//! - Both sit on a shared `PoolManager` (single or sharded)
//!
//! ## Usage
//!
//! ```rust,ignore
//! let users: NamedCache<i64, User> = manager.get_cache("users")?;
//!
//! users.put(&user_id, &user);
//! let user = users.get(&user_id);
//! ```

mod manager;
mod named;

pub use manager::CacheManager;
pub use named::NamedCache;
