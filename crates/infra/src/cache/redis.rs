//! Redis cache backend.

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::ConnectionManager};

use super::{Cache, CacheError};

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            CacheError::Connection(err.to_string())
        } else {
            CacheError::Backend(err.to_string())
        }
    }
}

/// Redis-backed cache. Cloning shares the underlying connection manager.
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
    default_ttl: Option<Duration>,
    key_prefix: Option<String>,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|e| CacheError::Connection(e.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        Ok(Self {
            connection,
            default_ttl: None,
            key_prefix: None,
        })
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    fn build_key(&self, key: &str) -> String {
        build_key(self.key_prefix.as_deref(), key)
    }
}

fn build_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{key}"),
        None => key.to_string(),
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(&key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();

        match ttl.or(self.default_ttl) {
            Some(ttl) => {
                let _: () = conn.set_ex(&key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(&key, value).await?;
            }
        }
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = keys.iter().map(|k| self.build_key(k)).collect();
        let mut conn = self.connection.clone();
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_when_configured() {
        assert_eq!(build_key(Some("readsync"), "GetAllQuery"), "readsync:GetAllQuery");
        assert_eq!(build_key(None, "GetAllQuery"), "GetAllQuery");
    }
}
