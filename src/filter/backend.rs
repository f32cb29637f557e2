// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage seam for bloom filters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::bloom::{Bitmap, BloomParams};
use super::FilterError;

/// Where filter bitmaps live.
///
/// Callers pass the parameters they believe the filter has; a backend that
/// finds different stored parameters must answer `ConfigMismatch` instead
/// of reading the wrong offsets.
#[async_trait]
pub trait FilterBackend: Send + Sync {
    /// Create the filter if absent. `Ok(true)` when it was created.
    async fn try_init(&self, name: &str, params: &BloomParams) -> Result<bool, FilterError>;

    /// Stored parameters, if the filter exists.
    async fn params(&self, name: &str) -> Result<Option<BloomParams>, FilterError>;

    /// Add one element; true if it was not already present.
    async fn add(&self, name: &str, params: &BloomParams, element: &str) -> Result<bool, FilterError>;

    /// Add many elements; returns how many were new.
    async fn add_batch(
        &self,
        name: &str,
        params: &BloomParams,
        elements: &[String],
    ) -> Result<u64, FilterError> {
        let mut added = 0;
        for element in elements {
            if self.add(name, params, element).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn contains(&self, name: &str, params: &BloomParams, element: &str) -> Result<bool, FilterError>;

    /// Number of set bits.
    async fn bits_set(&self, name: &str) -> Result<u64, FilterError>;

    async fn delete(&self, name: &str) -> Result<(), FilterError>;

    /// Atomically move filter `from` over `to`, replacing it.
    async fn replace(&self, from: &str, to: &str) -> Result<(), FilterError>;

    /// Take the exclusive lock `lock` for `owner`, expiring after `ttl`.
    /// `Ok(false)` while it is held, even by `owner` itself.
    async fn try_lock(&self, lock: &str, owner: &str, ttl: Duration) -> Result<bool, FilterError>;

    /// Release `lock` if `owner` still holds it.
    async fn unlock(&self, lock: &str, owner: &str) -> Result<(), FilterError>;

    async fn ping(&self) -> Result<(), FilterError>;
}

struct LocalFilter {
    params: BloomParams,
    bitmap: Bitmap,
}

struct LockSlot {
    owner: String,
    expires_at: Instant,
}

/// In-process filter backend for single-node deployments and tests.
#[derive(Default)]
pub struct LocalFilterBackend {
    filters: DashMap<String, Arc<LocalFilter>>,
    locks: DashMap<String, LockSlot>,
}

impl LocalFilterBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    fn checked(&self, name: &str, params: &BloomParams) -> Result<Arc<LocalFilter>, FilterError> {
        let filter = self
            .filters
            .get(name)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| FilterError::NotFound(name.to_string()))?;
        if !filter.params.same_shape(params) {
            return Err(FilterError::ConfigMismatch { name: name.to_string() });
        }
        Ok(filter)
    }
}

#[async_trait]
impl FilterBackend for LocalFilterBackend {
    async fn try_init(&self, name: &str, params: &BloomParams) -> Result<bool, FilterError> {
        let mut created = false;
        self.filters.entry(name.to_string()).or_insert_with(|| {
            created = true;
            Arc::new(LocalFilter {
                params: *params,
                bitmap: Bitmap::new(params.size_bits),
            })
        });
        Ok(created)
    }

    async fn params(&self, name: &str) -> Result<Option<BloomParams>, FilterError> {
        Ok(self.filters.get(name).map(|f| f.params))
    }

    async fn add(&self, name: &str, params: &BloomParams, element: &str) -> Result<bool, FilterError> {
        let filter = self.checked(name, params)?;
        Ok(filter.bitmap.set_all(&params.positions(element)))
    }

    async fn add_batch(
        &self,
        name: &str,
        params: &BloomParams,
        elements: &[String],
    ) -> Result<u64, FilterError> {
        let filter = self.checked(name, params)?;
        Ok(elements
            .iter()
            .filter(|e| filter.bitmap.set_all(&params.positions(e)))
            .count() as u64)
    }

    async fn contains(&self, name: &str, params: &BloomParams, element: &str) -> Result<bool, FilterError> {
        let filter = self.checked(name, params)?;
        Ok(filter.bitmap.test_all(&params.positions(element)))
    }

    async fn bits_set(&self, name: &str) -> Result<u64, FilterError> {
        self.filters
            .get(name)
            .map(|f| f.bitmap.bits_set())
            .ok_or_else(|| FilterError::NotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), FilterError> {
        self.filters.remove(name);
        Ok(())
    }

    async fn replace(&self, from: &str, to: &str) -> Result<(), FilterError> {
        let (_, staged) = self
            .filters
            .remove(from)
            .ok_or_else(|| FilterError::NotFound(from.to_string()))?;
        self.filters.insert(to.to_string(), staged);
        Ok(())
    }

    async fn try_lock(&self, lock: &str, owner: &str, ttl: Duration) -> Result<bool, FilterError> {
        let now = Instant::now();
        let slot = LockSlot {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };
        match self.locks.entry(lock.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(true)
            }
            Entry::Occupied(mut held) if held.get().expires_at <= now => {
                held.insert(slot);
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
        }
    }

    async fn unlock(&self, lock: &str, owner: &str) -> Result<(), FilterError> {
        self.locks.remove_if(lock, |_, slot| slot.owner == owner);
        Ok(())
    }

    async fn ping(&self) -> Result<(), FilterError> {
        Ok(())
    }
}
