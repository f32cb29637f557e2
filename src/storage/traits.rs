use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Storage circuit open, call rejected")]
    Unavailable,
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Shared key/value tier with per-key expiry.
///
/// Keys arrive fully qualified; values are opaque bytes.
#[async_trait]
pub trait DistributedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` for `ttl` (native granularity of the backend).
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Delete several keys. Default implementation deletes one by one.
    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    /// Liveness check.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// TTL in whole seconds for stores with second granularity: rounded up,
/// never zero (a zero `EX` is rejected, and rounding down would expire
/// sub-second TTLs immediately).
#[must_use]
pub fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_secs_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
        assert_eq!(ttl_secs(Duration::from_millis(60_001)), 61);
        assert_eq!(ttl_secs(Duration::from_millis(1)), 1);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }
}
