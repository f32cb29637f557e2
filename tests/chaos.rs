//! Chaos Testing for paycache
//!
//! This module tests failure scenarios using:
//! 1. **Failing wrappers** - precise error injection into stores, filter backends and loaders
//! 2. **Slow wrappers** - calls that outlive their deadline
//! 3. **Data corruption** - garbage bytes in the distributed tier
//! 4. **Container killing** - Redis dying under a live cache (requires Docker)
//!
//! The invariant under test everywhere: a failing cache tier or filter
//! degrades transparently; only system-of-record failures reach the caller.
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos
//! cargo test --test chaos -- --ignored --nocapture   # container tests
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use paycache::filter::BloomParams;
use paycache::{
    AbsentReason, CacheAsideAccessor, CacheConfig, DistributedStore, EntityClass, EntityLoader,
    FilterBackend, FilterDomain, FilterError, IdentifierSource, InMemoryStore, KeyPolicy, LoadError,
    LocalFilterBackend, MembershipFilter, RedisStore, StorageError, TieredCache,
};

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

// =============================================================================
// Failing Wrappers - Precise Error Injection
// =============================================================================

/// A store that fails on chosen calls, or on every call once switched off.
#[allow(dead_code)]
pub struct FailingStore<S: DistributedStore> {
    inner: S,
    call_count: AtomicU64,
    /// Fail on these call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    /// Fail every call while set
    down: AtomicBool,
}

#[allow(dead_code)]
impl<S: DistributedStore> FailingStore<S> {
    pub fn new(inner: S, fail_on_calls: Vec<u64>) -> Self {
        Self {
            inner,
            call_count: AtomicU64::new(0),
            fail_on_calls,
            down: AtomicBool::new(false),
        }
    }

    pub fn always_down(inner: S) -> Self {
        let store = Self::new(inner, vec![]);
        store.down.store(true, Ordering::SeqCst);
        store
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<(), StorageError> {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.down.load(Ordering::SeqCst) || self.fail_on_calls.contains(&count) {
            Err(StorageError::Backend("connection reset by peer".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: DistributedStore> DistributedStore for FailingStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.maybe_fail()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.put(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.delete(key).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.ping().await
    }
}

/// A store whose every call takes `delay`.
pub struct SlowStore {
    inner: InMemoryStore,
    delay: Duration,
}

#[async_trait]
impl DistributedStore for SlowStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(key).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.ping().await
    }
}

/// A filter backend that can be switched off after the filter was built.
pub struct FlakyFilterBackend {
    inner: LocalFilterBackend,
    down: AtomicBool,
}

impl FlakyFilterBackend {
    fn new() -> Self {
        Self {
            inner: LocalFilterBackend::new(),
            down: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), FilterError> {
        if self.down.load(Ordering::SeqCst) {
            Err(FilterError::Backend("filter backend unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FilterBackend for FlakyFilterBackend {
    async fn try_init(&self, name: &str, params: &BloomParams) -> Result<bool, FilterError> {
        self.check()?;
        self.inner.try_init(name, params).await
    }

    async fn params(&self, name: &str) -> Result<Option<BloomParams>, FilterError> {
        self.check()?;
        self.inner.params(name).await
    }

    async fn add(&self, name: &str, params: &BloomParams, element: &str) -> Result<bool, FilterError> {
        self.check()?;
        self.inner.add(name, params, element).await
    }

    async fn contains(&self, name: &str, params: &BloomParams, element: &str) -> Result<bool, FilterError> {
        self.check()?;
        self.inner.contains(name, params, element).await
    }

    async fn bits_set(&self, name: &str) -> Result<u64, FilterError> {
        self.check()?;
        self.inner.bits_set(name).await
    }

    async fn delete(&self, name: &str) -> Result<(), FilterError> {
        self.check()?;
        self.inner.delete(name).await
    }

    async fn replace(&self, from: &str, to: &str) -> Result<(), FilterError> {
        self.check()?;
        self.inner.replace(from, to).await
    }

    async fn try_lock(&self, lock: &str, owner: &str, ttl: Duration) -> Result<bool, FilterError> {
        self.check()?;
        self.inner.try_lock(lock, owner, ttl).await
    }

    async fn unlock(&self, lock: &str, owner: &str) -> Result<(), FilterError> {
        self.check()?;
        self.inner.unlock(lock, owner).await
    }

    async fn ping(&self) -> Result<(), FilterError> {
        self.check()
    }
}

/// Id source that dies after the first page.
struct DyingSource {
    pages_served: AtomicUsize,
}

#[async_trait]
impl IdentifierSource for DyingSource {
    async fn count(&self) -> Result<u64, LoadError> {
        Ok(10_000)
    }

    async fn scan(&self, offset: u64, limit: usize) -> Result<Vec<String>, LoadError> {
        if self.pages_served.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(LoadError::source("replica went away"));
        }
        Ok((offset..offset + limit as u64).map(|i| format!("N{}", i)).collect())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Merchant {
    mch_no: String,
    name: String,
}

fn merchant(no: &str) -> Merchant {
    Merchant {
        mch_no: no.to_string(),
        name: format!("Merchant {}", no),
    }
}

struct Merchants {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl Merchants {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl EntityLoader<Merchant> for Arc<Merchants> {
    async fn load(&self, id: &str) -> Result<Option<Merchant>, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(LoadError::source("too many connections"));
        }
        Ok(id.starts_with('M').then(|| merchant(id)))
    }
}

fn fast_config() -> CacheConfig {
    let mut config = CacheConfig::default();
    config.l2.timeout_ms = 50;
    config.l2.circuit_failure_threshold = 4;
    config.l2.circuit_recovery_timeout_secs = 60;
    config
}

fn cache_over(config: &CacheConfig, store: Arc<dyn DistributedStore>) -> TieredCache<Merchant> {
    let keys = Arc::new(KeyPolicy::from_config(config));
    TieredCache::new("mch:info", config, keys, Some(store)).for_entity(EntityClass::MerchantInfo)
}

// =============================================================================
// Distributed Tier Failures
// =============================================================================

#[tokio::test]
async fn chaos_l2_down_degrades_to_l1_and_loader() {
    let config = fast_config();
    let store = Arc::new(FailingStore::always_down(InMemoryStore::new()));
    let cache = cache_over(&config, store.clone());
    let loader = Merchants::new();

    for _ in 0..3 {
        let got = cache.get_with("M1", || loader.load("M1")).await.unwrap();
        assert_eq!(got.unwrap().mch_no, "M1");
    }
    // Loaded once, then served from L1 despite L2 being down
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

    // get + put of the first lookup failed; the health ping makes three
    assert_eq!(cache.health_snapshot().l2_consecutive_failures, 2);
    let health = cache.health().await;
    assert!(health.is_degraded());
    assert!(health.l2_consecutive_failures >= 3);
}

#[tokio::test]
async fn chaos_l2_recovers_after_transient_errors() {
    let config = CacheConfig::default();
    // First two calls fail: the L2 get and the L2 put of the first lookup
    let store = Arc::new(FailingStore::new(InMemoryStore::new(), vec![1, 2]));
    let cache = cache_over(&config, store.clone());
    let loader = Merchants::new();

    cache.get_with("M2", || loader.load("M2")).await.unwrap();
    assert_eq!(cache.health_snapshot().l2_consecutive_failures, 2);

    cache.put("M3", merchant("M3")).await;
    let health = cache.health().await;
    assert!(health.l2_healthy);
    assert_eq!(health.l2_consecutive_failures, 0);
}

#[tokio::test]
async fn chaos_slow_l2_is_a_miss_not_a_stall() {
    let config = fast_config();
    let store: Arc<dyn DistributedStore> = Arc::new(SlowStore {
        inner: InMemoryStore::new(),
        delay: Duration::from_secs(5),
    });
    let cache = cache_over(&config, store);
    let loader = Merchants::new();

    let started = std::time::Instant::now();
    let got = cache.get_with("M4", || loader.load("M4")).await.unwrap();

    assert_eq!(got.unwrap().mch_no, "M4");
    // get + put deadlines, nowhere near the 5s store delay
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn chaos_circuit_opens_and_stops_hammering_l2() {
    let mut config = fast_config();
    config.l1.enabled = false;
    let store = Arc::new(FailingStore::always_down(InMemoryStore::new()));
    let cache = cache_over(&config, store.clone());
    let loader = Merchants::new();

    for i in 0..20 {
        let id = format!("M{}", 100 + i);
        cache.get_with(&id, || loader.load(&id)).await.unwrap();
    }

    let health = cache.health_snapshot();
    assert!(health.circuit_rejections > 0);
    // 20 lookups = 40 L2 calls without a breaker
    assert!(store.calls() < 40, "store saw {} calls", store.calls());
    assert_eq!(loader.calls.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn chaos_corrupt_l2_payloads_are_replaced() {
    let config = CacheConfig::default();
    let store = Arc::new(InMemoryStore::new());
    for garbage in [&b"\x00\xff\x13"[..], b"{\"kind\":\"value\"}", b"[]", b"null"] {
        store.put("paycache:mch:info:M5", garbage, Duration::from_secs(60)).await.unwrap();
        let cache = cache_over(&config, store.clone());
        let loader = Merchants::new();

        let got = cache.get_with("mch:info:M5", || loader.load("M5")).await.unwrap();
        assert_eq!(got.unwrap().mch_no, "M5");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        // The fresh value replaced the garbage
        let fresh = cache_over(&config, store.clone());
        assert!(fresh.get("mch:info:M5").await.is_some());
    }
}

// =============================================================================
// Loader Failures
// =============================================================================

#[tokio::test]
async fn chaos_loader_failure_surfaces_and_is_not_cached() {
    let config = CacheConfig::default();
    let store = Arc::new(InMemoryStore::new());
    let cache = cache_over(&config, store.clone());
    let loader = Merchants::new();
    loader.failing.store(true, Ordering::SeqCst);

    let err = cache.get_with("M6", || loader.load("M6")).await.unwrap_err();
    assert!(err.to_string().contains("too many connections"));
    assert!(store.is_empty());

    loader.failing.store(false, Ordering::SeqCst);
    assert!(cache.get_with("M6", || loader.load("M6")).await.unwrap().is_some());
}

#[tokio::test]
async fn chaos_loader_timeout_surfaces() {
    struct Hanging;

    #[async_trait]
    impl EntityLoader<Merchant> for Hanging {
        async fn load(&self, _id: &str) -> Result<Option<Merchant>, LoadError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }
    }

    let mut config = CacheConfig::default();
    config.loader_timeout_ms = 30;
    let keys = Arc::new(KeyPolicy::from_config(&config));
    let accessor = CacheAsideAccessor::new(
        EntityClass::MerchantInfo,
        TieredCache::new("mch:info", &config, keys, None),
        Hanging,
    );

    let err = accessor.get("M7").await.unwrap_err();
    assert!(err.is_timeout());
    // A timeout is not "absent": nothing was cached
    assert!(accessor.peek("M7").await.is_none());
}

// =============================================================================
// Filter Failures
// =============================================================================

#[tokio::test]
async fn chaos_filter_down_fails_open() {
    let config = CacheConfig::default();
    let keys = Arc::new(KeyPolicy::from_config(&config));
    let backend = Arc::new(FlakyFilterBackend::new());
    let filter = Arc::new(MembershipFilter::new(backend.clone(), keys.clone(), config.filter.timeout()));
    filter.init(FilterDomain::MerchantNo, 1_000, 0.01).await.unwrap();
    filter.add(FilterDomain::MerchantNo, "M8").await.unwrap();

    let loader = Merchants::new();
    let accessor = CacheAsideAccessor::new(
        EntityClass::MerchantInfo,
        TieredCache::new("mch:info", &config, keys, None),
        loader.clone(),
    )
    .with_filter(filter.clone(), FilterDomain::MerchantNo);

    // Healthy filter rejects an unknown id outright
    assert_eq!(
        accessor.get("M9").await.unwrap().absent_reason(),
        Some(AbsentReason::Filtered)
    );

    backend.down.store(true, Ordering::SeqCst);
    assert!(!filter.health().await);

    // Unsure now: both ids fall through to the loader
    assert!(accessor.get("M8").await.unwrap().is_found());
    assert!(accessor.get("M9").await.unwrap().is_found());
    assert_eq!(loader.calls.load(Ordering::SeqCst), 2);

    // Adds surface the error to the caller
    assert!(filter.add(FilterDomain::MerchantNo, "M10").await.is_err());
}

#[tokio::test]
async fn chaos_failed_rebuild_keeps_previous_filter() {
    let keys = Arc::new(KeyPolicy::new("paycache"));
    let backend = Arc::new(LocalFilterBackend::new());
    let filter = MembershipFilter::new(backend.clone(), keys, Duration::from_secs(1));
    filter.init(FilterDomain::MerchantNo, 1_000, 0.01).await.unwrap();
    filter.add(FilterDomain::MerchantNo, "M-original").await.unwrap();

    let source = DyingSource {
        pages_served: AtomicUsize::new(0),
    };
    let result = filter.rebuild(FilterDomain::MerchantNo, 20_000, 0.01, &source, 100).await;

    assert!(result.is_err());
    assert!(!filter.is_rebuilding(FilterDomain::MerchantNo));
    assert!(filter.might_contain(FilterDomain::MerchantNo, "M-original").await);
    // Staging filter cleaned up
    assert_eq!(backend.len(), 1);
}

#[tokio::test]
async fn chaos_rebuild_with_filter_backend_down_is_not_reported_as_busy() {
    let keys = Arc::new(KeyPolicy::new("paycache"));
    let backend = Arc::new(FlakyFilterBackend::new());
    let filter = MembershipFilter::new(backend.clone(), keys, Duration::from_secs(1));
    filter.init(FilterDomain::IsvNo, 1_000, 0.01).await.unwrap();

    backend.down.store(true, Ordering::SeqCst);
    let source = DyingSource {
        pages_served: AtomicUsize::new(0),
    };
    let result = filter.rebuild(FilterDomain::IsvNo, 1_000, 0.01, &source, 100).await;
    assert!(matches!(result, Err(FilterError::Backend(_))));
    assert!(!filter.is_rebuilding(FilterDomain::IsvNo));

    // Claim released, so the next attempt runs once the backend is back
    backend.down.store(false, Ordering::SeqCst);
    let source = DyingSource {
        pages_served: AtomicUsize::new(0),
    };
    let result = filter.rebuild(FilterDomain::IsvNo, 1_000, 0.01, &source, 100).await;
    assert!(matches!(result, Err(FilterError::Source(_))));
}

// =============================================================================
// Container Helpers
// =============================================================================

fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

// =============================================================================
// Chaos Tests - Container Killing (Abrupt Death)
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn chaos_redis_dies_mid_traffic() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));

    let config = fast_config();
    let store: Arc<dyn DistributedStore> = Arc::new(RedisStore::new(&url).await.unwrap());
    let cache = cache_over(&config, store);
    let loader = Merchants::new();

    cache.get_with("M20", || loader.load("M20")).await.unwrap();
    assert!(cache.health().await.l2_healthy);

    redis.stop();

    // Cached entry still served from L1; new ids still load
    assert!(cache.get_with("M20", || loader.load("M20")).await.unwrap().is_some());
    assert!(cache.get_with("M21", || loader.load("M21")).await.unwrap().is_some());
    assert_eq!(loader.calls.load(Ordering::SeqCst), 2);

    for _ in 0..3 {
        cache.health().await;
    }
    assert!(cache.health_snapshot().is_degraded());
}
