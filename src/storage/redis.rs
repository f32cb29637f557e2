//! Redis backend for the distributed tier.
//!
//! Values are plain strings written with `SET key value EX <secs>`. The TTL
//! travels in Redis' native unit (seconds), rounded up so a sub-second TTL
//! never becomes "expire immediately".
//!
//! No per-call retry here: a slow or failing Redis must surface quickly so
//! the tiered cache can count it as a miss and fall through to the loader.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use super::traits::{ttl_secs, DistributedStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect, retrying with backoff during startup.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use paycache::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = RedisStore::new("redis://localhost:6379").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::connect_with(connection_string, &RetryConfig::startup()).await
    }

    pub async fn connect_with(connection_string: &str, retry_config: &RetryConfig) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)?;

        let connection = retry("redis_connect", retry_config, || async {
            ConnectionManager::new(client.clone()).await
        })
        .await?;

        Ok(Self { connection })
    }

    /// Wrap an already established connection.
    #[must_use]
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    /// Get a clone of the connection manager (for sharing with the filter backend)
    #[must_use]
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Remaining TTL of a key in seconds (`None` if absent or persistent).
    pub async fn ttl(&self, key: &str) -> Result<Option<u64>, StorageError> {
        let mut conn = self.connection.clone();
        let ttl: i64 = conn.ttl(key).await?;
        Ok(u64::try_from(ttl).ok())
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.connection.clone();
        let data: Option<Vec<u8>> = conn.get(key).await?;
        Ok(data)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: () = conn.set_ex(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
