use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{DistributedStore, StorageError};

struct Slot {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process stand-in for the distributed tier.
///
/// Expiry is millisecond-accurate and checked lazily on read.
pub struct InMemoryStore {
    data: DashMap<String, Slot>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current entry count (including not yet purged expired entries)
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.data.clear();
    }

    /// Remaining lifetime of a live key.
    #[must_use]
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let slot = self.data.get(key)?;
        let now = Instant::now();
        (slot.expires_at > now).then(|| slot.expires_at - now)
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, slot| slot.expires_at > now);
        before - self.data.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let now = Instant::now();
        match self.data.get(key) {
            None => return Ok(None),
            Some(slot) if slot.expires_at > now => return Ok(Some(slot.value.clone())),
            Some(_) => {}
        }
        self.data.remove_if(key, |_, slot| slot.expires_at <= now);
        Ok(None)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError> {
        self.data.insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
