//! Non-authoritative query cache.
//!
//! Read paths populate entries with `set`; the invalidator removes them after
//! mutating events. Entries also expire on their TTL, which bounds staleness when
//! an invalidation is lost.

pub mod in_memory;
pub mod invalidation;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use in_memory::InMemoryCache;
pub use invalidation::{CacheInvalidator, InvalidationPolicy, InvalidationReport, KeyTemplate};
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache connection error: {0}")]
    Connection(String),
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` under `key`. `None` falls back to the backend's default TTL.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Remove every key in `keys`; missing keys are ignored.
    async fn remove(&self, keys: &[String]) -> Result<(), CacheError>;
}

#[async_trait]
impl<T: Cache + ?Sized> Cache for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn remove(&self, keys: &[String]) -> Result<(), CacheError> {
        (**self).remove(keys).await
    }
}
