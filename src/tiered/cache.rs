// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier read-through cache.
//!
//! Lookups check L1 (moka, in-process) then L2 (distributed store), and
//! only then call the loader. Values found in L2 are promoted into L1.
//!
//! The distributed tier is best-effort: every call runs under a deadline
//! and the circuit breaker, and any failure is logged, counted and treated
//! as a miss (reads) or skipped (writes). Only loader errors reach the
//! caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::entry::{self, Cached, L1Slot, SlotExpiry};
use super::health::{L2HealthTracker, TierHealth};
use super::stats::{CacheStats, StatsCounters};
use crate::config::CacheConfig;
use crate::policy::{EntityClass, KeyPolicy, MIN_TTL};
use crate::resilience::{CircuitBreaker, CircuitError};
use crate::source::{load_with_timeout, LoadError};
use crate::storage::{DistributedStore, StorageError};

/// How [`TieredCache::fetch`] answered.
#[derive(Debug)]
pub enum Fetched<V> {
    /// Found in L1 or L2
    Hit(Arc<V>),
    /// A negative sentinel was cached; the loader was not called
    NegativeHit,
    /// Loaded from the system of record and cached
    Loaded(Arc<V>),
    /// The loader found nothing
    LoadedAbsent,
}

impl<V> Fetched<V> {
    #[must_use]
    pub fn into_value(self) -> Option<Arc<V>> {
        match self {
            Self::Hit(v) | Self::Loaded(v) => Some(v),
            Self::NegativeHit | Self::LoadedAbsent => None,
        }
    }

    /// Answered without calling the loader.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Hit(_) | Self::NegativeHit)
    }
}

/// A named cache over L1 and (optionally) L2.
///
/// Keys are qualified with the [`KeyPolicy`] namespace before they reach
/// either tier. With an entity class set, TTLs come from that class's
/// policy (jittered per write); otherwise from the L2 defaults.
pub struct TieredCache<V> {
    name: String,
    keys: Arc<KeyPolicy>,
    entity: Option<EntityClass>,

    l1: Option<Cache<String, L1Slot<V>>>,
    l1_write_window: Duration,

    l2: Option<Arc<dyn DistributedStore>>,
    l2_timeout: Duration,
    circuit: CircuitBreaker,
    l2_health: L2HealthTracker,

    default_ttl: Duration,
    negative_ttl: Duration,
    cache_null_values: bool,
    loader_timeout: Duration,

    stats: StatsCounters,
}

impl<V> TieredCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build a cache. `l2` is ignored when `config.l2.enabled` is false.
    pub fn new(
        name: impl Into<String>,
        config: &CacheConfig,
        keys: Arc<KeyPolicy>,
        l2: Option<Arc<dyn DistributedStore>>,
    ) -> Self {
        let name = name.into();

        let l1 = config.l1.enabled.then(|| {
            Cache::builder()
                .name(&name)
                .max_capacity(config.l1.max_capacity)
                .initial_capacity(config.l1.initial_capacity)
                .time_to_live(config.l1.expire_after_write().max(MIN_TTL))
                .time_to_idle(config.l1.expire_after_access().max(MIN_TTL))
                .expire_after(SlotExpiry)
                .build()
        });

        let l2 = if config.l2.enabled { l2 } else { None };

        Self {
            circuit: CircuitBreaker::new(format!("l2:{}", name), config.l2.circuit()),
            name,
            keys,
            entity: None,
            l1,
            l1_write_window: config.l1.expire_after_write().max(MIN_TTL),
            l2,
            l2_timeout: config.l2.timeout(),
            l2_health: L2HealthTracker::new(),
            default_ttl: config.l2.default_ttl().max(MIN_TTL),
            negative_ttl: config.l2.negative_ttl().max(MIN_TTL),
            cache_null_values: config.cache_null_values,
            loader_timeout: config.loader_timeout(),
            stats: StatsCounters::default(),
        }
    }

    /// Take TTLs from the policy of `class`.
    #[must_use]
    pub fn for_entity(mut self, class: EntityClass) -> Self {
        self.entity = Some(class);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn entity(&self) -> Option<EntityClass> {
        self.entity
    }

    #[must_use]
    pub fn key_policy(&self) -> &Arc<KeyPolicy> {
        &self.keys
    }

    // --- Reads ---

    /// Look a key up in L1 then L2. `None` means neither tier knows it;
    /// `Some(Cached::Absent)` is a cached negative answer.
    #[tracing::instrument(skip(self), fields(cache = %self.name, tier))]
    pub async fn lookup(&self, key: &str) -> Option<Cached<V>> {
        let key = self.keys.qualify(key);

        if let Some(ref l1) = self.l1 {
            if let Some(slot) = l1.get(&*key) {
                self.stats.l1(true);
                crate::metrics::record_cache_lookup(&self.name, "l1", "hit");
                tracing::Span::current().record("tier", "l1");
                return Some(slot.entry);
            }
            self.stats.l1(false);
            crate::metrics::record_cache_lookup(&self.name, "l1", "miss");
        }

        let store = self.l2.as_ref()?;
        let found = match self.l2_call("get", &key, store.get(&key)).await.flatten() {
            Some(bytes) => match entry::decode::<V>(&bytes) {
                Ok(cached) => Some(cached),
                Err(e) => {
                    warn!(cache = %self.name, key = %key, error = %e, "Undecodable L2 entry, dropping it");
                    crate::metrics::record_error("l2", "decode", "serialization");
                    self.l2_call("delete", &key, store.delete(&key)).await;
                    None
                }
            },
            None => None,
        };

        match found {
            Some(cached) => {
                self.stats.l2(true);
                crate::metrics::record_cache_lookup(&self.name, "l2", "hit");
                tracing::Span::current().record("tier", "l2");
                let ttl = if cached.is_absent() { self.negative_ttl() } else { self.l1_write_window };
                self.put_l1(&key, cached.clone(), ttl);
                debug!(cache = %self.name, key = %key, "L2 hit, promoted to L1");
                Some(cached)
            }
            None => {
                self.stats.l2(false);
                crate::metrics::record_cache_lookup(&self.name, "l2", "miss");
                tracing::Span::current().record("tier", "miss");
                None
            }
        }
    }

    /// Cached value, if any. Negative sentinels read as `None`.
    pub async fn get(&self, key: &str) -> Option<Arc<V>> {
        self.lookup(key).await.and_then(Cached::into_value)
    }

    /// Read-through: serve from the tiers, otherwise call `loader` once
    /// and cache what it returns (a negative sentinel for `None` when
    /// `cache_null_values` is set). Loader errors are returned and nothing
    /// is cached for them.
    pub async fn fetch<F, Fut>(&self, key: &str, loader: F) -> Result<Fetched<V>, LoadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, LoadError>>,
    {
        self.fetch_inner(key, None, loader).await
    }

    /// [`fetch`](Self::fetch) returning just the value.
    pub async fn get_with<F, Fut>(&self, key: &str, loader: F) -> Result<Option<Arc<V>>, LoadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, LoadError>>,
    {
        Ok(self.fetch_inner(key, None, loader).await?.into_value())
    }

    /// Like [`get_with`](Self::get_with) but a loaded value is cached for
    /// exactly `ttl` instead of the policy TTL.
    pub async fn get_with_ttl<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<Arc<V>>, LoadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, LoadError>>,
    {
        Ok(self.fetch_inner(key, Some(ttl), loader).await?.into_value())
    }

    async fn fetch_inner<F, Fut>(&self, key: &str, ttl: Option<Duration>, loader: F) -> Result<Fetched<V>, LoadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, LoadError>>,
    {
        match self.lookup(key).await {
            Some(Cached::Value(v)) => return Ok(Fetched::Hit(v)),
            Some(Cached::Absent) => return Ok(Fetched::NegativeHit),
            None => {}
        }

        let loaded = match load_with_timeout(self.loader_timeout, loader()).await {
            Ok(loaded) => loaded,
            Err(e) => {
                let outcome = if e.is_timeout() { "timeout" } else { "error" };
                crate::metrics::record_load(&self.name, outcome);
                warn!(cache = %self.name, key, error = %e, "Loader failed, nothing cached");
                return Err(e);
            }
        };

        match loaded {
            Some(value) => {
                crate::metrics::record_load(&self.name, "found");
                let value = Arc::new(value);
                let ttl = ttl.map_or_else(|| self.value_ttl(), |t| t.max(MIN_TTL));
                self.store(key, Cached::Value(Arc::clone(&value)), ttl).await;
                Ok(Fetched::Loaded(value))
            }
            None => {
                crate::metrics::record_load(&self.name, "absent");
                if self.cache_null_values {
                    self.put_negative(key).await;
                }
                Ok(Fetched::LoadedAbsent)
            }
        }
    }

    // --- Writes ---

    /// Write a value to both tiers with the policy TTL.
    pub async fn put(&self, key: &str, value: V) {
        let ttl = self.value_ttl();
        self.store(key, Cached::Value(Arc::new(value)), ttl).await;
    }

    /// Write an already shared value with the policy TTL.
    pub async fn put_shared(&self, key: &str, value: Arc<V>) {
        let ttl = self.value_ttl();
        self.store(key, Cached::Value(value), ttl).await;
    }

    /// Write a value to both tiers with an explicit TTL.
    pub async fn put_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        self.store(key, Cached::Value(Arc::new(value)), ttl.max(MIN_TTL)).await;
    }

    /// Cache "confirmed absent" for the negative TTL.
    pub async fn put_negative(&self, key: &str) {
        crate::metrics::record_negative_cached(&self.name);
        self.store(key, Cached::Absent, self.negative_ttl()).await;
    }

    /// Remove a key from both tiers. Never fails; an unreachable L2 copy
    /// simply expires on its own.
    pub async fn evict(&self, key: &str) {
        let key = self.keys.qualify(key);
        if let Some(ref l1) = self.l1 {
            l1.invalidate(&*key);
        }
        if let Some(ref store) = self.l2 {
            self.l2_call("delete", &key, store.delete(&key)).await;
        }
        crate::metrics::record_eviction(&self.name, 1);
        debug!(cache = %self.name, key = %key, "Evicted");
    }

    /// Remove several keys from both tiers.
    pub async fn evict_many(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let qualified: Vec<String> = keys.iter().map(|k| self.keys.qualify(k).into_owned()).collect();
        if let Some(ref l1) = self.l1 {
            for key in &qualified {
                l1.invalidate(key);
            }
        }
        if let Some(ref store) = self.l2 {
            let batch = format!("{} keys", qualified.len());
            self.l2_call("delete_many", &batch, store.delete_many(&qualified)).await;
        }
        crate::metrics::record_eviction(&self.name, qualified.len());
    }

    /// Drop every L1 entry. L2 is shared with other processes and is left alone.
    pub fn clear(&self) {
        if let Some(ref l1) = self.l1 {
            l1.invalidate_all();
            l1.run_pending_tasks();
            crate::metrics::set_l1_entries(&self.name, 0);
        }
    }

    // --- Introspection ---

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Approximate number of L1 entries.
    #[must_use]
    pub fn l1_entry_count(&self) -> u64 {
        match self.l1 {
            Some(ref l1) => {
                l1.run_pending_tasks();
                let count = l1.entry_count();
                crate::metrics::set_l1_entries(&self.name, count);
                count
            }
            None => 0,
        }
    }

    /// Ping L2 and report tier health.
    pub async fn health(&self) -> TierHealth {
        if let Some(ref store) = self.l2 {
            self.l2_call("ping", "-", store.ping()).await;
        }
        self.health_snapshot()
    }

    /// Tier health from recent traffic, without probing.
    #[must_use]
    pub fn health_snapshot(&self) -> TierHealth {
        TierHealth {
            l1_enabled: self.l1.is_some(),
            l2_enabled: self.l2.is_some(),
            l2_healthy: self.l2.is_some() && self.l2_health.is_healthy(),
            l2_consecutive_failures: self.l2_health.failure_count(),
            circuit_rejections: self.circuit.rejections(),
        }
    }

    // --- Internals ---

    fn value_ttl(&self) -> Duration {
        match self.entity {
            Some(class) => self.keys.resolve_ttl(class),
            None => self.default_ttl,
        }
    }

    fn negative_ttl(&self) -> Duration {
        match self.entity {
            Some(class) => self.keys.resolve_negative_ttl(class).max(MIN_TTL),
            None => self.negative_ttl,
        }
    }

    fn put_l1(&self, key: &str, entry: Cached<V>, ttl: Duration) {
        if let Some(ref l1) = self.l1 {
            l1.insert(key.to_string(), L1Slot { entry, ttl: ttl.max(MIN_TTL) });
        }
    }

    async fn store(&self, key: &str, cached: Cached<V>, ttl: Duration) {
        let key = self.keys.qualify(key);
        let encoded = self.l2.as_ref().map(|_| entry::encode(&cached));

        // In-process first, distributed second; not atomic across tiers
        self.put_l1(&key, cached, ttl);

        match (&self.l2, encoded) {
            (Some(store), Some(Ok(bytes))) => {
                self.l2_call("put", &key, store.put(&key, &bytes, ttl)).await;
            }
            (Some(_), Some(Err(e))) => {
                warn!(cache = %self.name, key = %key, error = %e, "Value not serializable, caching in L1 only");
                crate::metrics::record_error("l2", "encode", "serialization");
            }
            _ => {}
        }
    }

    /// Run one L2 call under the deadline and the breaker. `None` when the
    /// call failed, timed out or was rejected.
    async fn l2_call<T, Fut>(&self, operation: &'static str, key: &str, fut: Fut) -> Option<T>
    where
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let _timer = crate::metrics::LatencyTimer::new("l2", operation);
        let deadline = self.l2_timeout;

        let result = self
            .circuit
            .call(|| async move {
                match tokio::time::timeout(deadline, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(StorageError::Timeout(deadline)),
                }
            })
            .await;

        match result {
            Ok(value) => {
                self.l2_health.record_success();
                Some(value)
            }
            Err(CircuitError::Rejected) => {
                self.l2_health.record_failure();
                crate::metrics::record_error("l2", operation, "circuit_open");
                debug!(cache = %self.name, key, operation, "L2 skipped, circuit open");
                None
            }
            Err(CircuitError::Inner(e)) => {
                self.l2_health.record_failure();
                let error_type = match e {
                    StorageError::Timeout(_) => {
                        crate::metrics::record_timeout("l2", operation);
                        "timeout"
                    }
                    StorageError::Backend(_) => "backend",
                    StorageError::Unavailable => "unavailable",
                };
                crate::metrics::record_error("l2", operation, error_type);
                warn!(cache = %self.name, key, operation, error = %e, "L2 call failed, degrading to L1 only");
                None
            }
        }
    }
}
