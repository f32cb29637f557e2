// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-aside access for one entity class.
//!
//! A lookup goes filter → tiered cache → loader, and remembers absence:
//!
//! ```text
//!   get(id) ──► filter.might_contain ──no──► Absent(Filtered)
//!                      │ maybe / unsure
//!                      ▼
//!               entries.lookup ──sentinel──► Absent(CachedNegative)
//!                      │ miss      └─value─► Found
//!                      ▼
//!                 loader.load ──none──► cache sentinel ► Absent(NotFound)
//!                      └─value──► cache value ► Found
//! ```
//!
//! Alias lookups resolve `(tenant, external id)` to the primary id through
//! a mapping cache first. A load by alias populates both the mapping and
//! the entry cache.
//!
//! Evicting after a write is the caller's job: call [`CacheAsideAccessor::evict`]
//! once the system of record has committed.

use std::sync::Arc;

use tracing::debug;

use crate::filter::{FilterDomain, FilterError, MembershipFilter};
use crate::policy::EntityClass;
use crate::source::{Alias, AliasLoader, EntityLoader, Identified, LoadError};
use crate::tiered::{CacheStats, Cached, Fetched, TieredCache};

/// Why a lookup answered "absent".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsentReason {
    /// The membership filter ruled the identifier out; no cache or loader I/O
    Filtered,
    /// A negative sentinel was cached
    CachedNegative,
    /// The loader confirmed absence
    NotFound,
    /// Blank identifier, answered without I/O
    EmptyIdentifier,
}

/// Outcome of a cache-aside lookup.
#[derive(Debug)]
pub enum Lookup<V> {
    Found(Arc<V>),
    Absent(AbsentReason),
}

impl<V> Lookup<V> {
    #[must_use]
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    #[must_use]
    pub fn value(&self) -> Option<&Arc<V>> {
        match self {
            Self::Found(v) => Some(v),
            Self::Absent(_) => None,
        }
    }

    #[must_use]
    pub fn into_option(self) -> Option<Arc<V>> {
        match self {
            Self::Found(v) => Some(v),
            Self::Absent(_) => None,
        }
    }

    #[must_use]
    pub fn absent_reason(&self) -> Option<AbsentReason> {
        match self {
            Self::Found(_) => None,
            Self::Absent(reason) => Some(*reason),
        }
    }
}

impl<V> From<Fetched<V>> for Lookup<V> {
    fn from(fetched: Fetched<V>) -> Self {
        match fetched {
            Fetched::Hit(v) | Fetched::Loaded(v) => Lookup::Found(v),
            Fetched::NegativeHit => Lookup::Absent(AbsentReason::CachedNegative),
            Fetched::LoadedAbsent => Lookup::Absent(AbsentReason::NotFound),
        }
    }
}

struct AliasRoute<V> {
    class: EntityClass,
    cache: Arc<TieredCache<String>>,
    loader: Arc<dyn AliasLoader<V>>,
}

/// Filter + tiered cache + loader for one entity class.
pub struct CacheAsideAccessor<V, L> {
    entity: EntityClass,
    entries: Arc<TieredCache<V>>,
    loader: L,
    filter: Option<(Arc<MembershipFilter>, FilterDomain)>,
    aliases: Option<AliasRoute<V>>,
}

impl<V, L> CacheAsideAccessor<V, L>
where
    V: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    L: EntityLoader<V>,
{
    /// `entries` takes its TTLs from the policy of `entity`.
    pub fn new(entity: EntityClass, entries: TieredCache<V>, loader: L) -> Self {
        Self {
            entity,
            entries: Arc::new(entries.for_entity(entity)),
            loader,
            filter: None,
            aliases: None,
        }
    }

    /// Pre-check identifiers against the filter of `domain`.
    #[must_use]
    pub fn with_filter(mut self, filter: Arc<MembershipFilter>, domain: FilterDomain) -> Self {
        self.filter = Some((filter, domain));
        self
    }

    /// Enable lookups by alias. `mappings` holds alias → primary id and
    /// takes its TTLs from the policy of `alias_class`.
    #[must_use]
    pub fn with_aliases(
        mut self,
        alias_class: EntityClass,
        mappings: TieredCache<String>,
        loader: Arc<dyn AliasLoader<V>>,
    ) -> Self {
        self.aliases = Some(AliasRoute {
            class: alias_class,
            cache: Arc::new(mappings.for_entity(alias_class)),
            loader,
        });
        self
    }

    #[must_use]
    pub fn entity(&self) -> EntityClass {
        self.entity
    }

    #[must_use]
    pub fn entries(&self) -> &Arc<TieredCache<V>> {
        &self.entries
    }

    /// Canonical cache key of a primary id.
    #[must_use]
    pub fn entry_key(&self, id: &str) -> String {
        self.entries.key_policy().entity_key(self.entity, id, None)
    }

    /// Cache key of an alias mapping, if aliases are enabled.
    #[must_use]
    pub fn alias_key(&self, alias: &Alias) -> Option<String> {
        self.aliases.as_ref().map(|route| {
            self.entries
                .key_policy()
                .entity_key(route.class, &alias.tenant, Some(&alias.external_id))
        })
    }

    /// Look an entity up by primary id.
    ///
    /// Only loader failures are returned as errors.
    pub async fn get(&self, id: &str) -> Result<Lookup<V>, LoadError> {
        if id.trim().is_empty() {
            return Ok(Lookup::Absent(AbsentReason::EmptyIdentifier));
        }

        if let Some((ref filter, domain)) = self.filter {
            if !filter.might_contain(domain, id).await {
                crate::metrics::record_penetration_blocked(self.entries.name());
                debug!(entity = %self.entity, id, "Filtered out, skipping cache and loader");
                return Ok(Lookup::Absent(AbsentReason::Filtered));
            }
        }

        self.fetch_entry(id).await
    }

    /// Look an entity up by alias. The filter is not consulted: it tracks
    /// primary ids only.
    pub async fn get_by_alias(&self, alias: &Alias) -> Result<Lookup<V>, LoadError>
    where
        V: Identified,
    {
        if alias.is_empty() {
            return Ok(Lookup::Absent(AbsentReason::EmptyIdentifier));
        }
        let route = self
            .aliases
            .as_ref()
            .ok_or_else(|| LoadError::source(format!("no alias loader configured for {}", self.entity)))?;
        let alias_key = self
            .entries
            .key_policy()
            .entity_key(route.class, &alias.tenant, Some(&alias.external_id));

        let mut loaded: Option<Arc<V>> = None;
        let slot = &mut loaded;
        let loader = &route.loader;
        let fetched = route
            .cache
            .fetch(&alias_key, move || async move {
                let found = loader.load_by_alias(alias).await?;
                Ok(found.map(|entity| {
                    let id = entity.primary_id();
                    *slot = Some(Arc::new(entity));
                    id
                }))
            })
            .await?;

        match fetched {
            Fetched::Hit(id) => {
                debug!(entity = %self.entity, alias = %alias, id = %id, "Alias resolved from cache");
                self.fetch_entry(&id).await
            }
            Fetched::NegativeHit => Ok(Lookup::Absent(AbsentReason::CachedNegative)),
            Fetched::Loaded(id) => match loaded {
                Some(entity) => {
                    self.entries.put_shared(&self.entry_key(&id), Arc::clone(&entity)).await;
                    Ok(Lookup::Found(entity))
                }
                None => self.fetch_entry(&id).await,
            },
            Fetched::LoadedAbsent => Ok(Lookup::Absent(AbsentReason::NotFound)),
        }
    }

    /// Drop the cached entry and, when known, the alias mapping. Call after
    /// any write to the entity.
    pub async fn evict(&self, id: &str, alias: Option<&Alias>) {
        if !id.is_empty() {
            self.entries.evict(&self.entry_key(id)).await;
        }
        if let (Some(alias), Some(route)) = (alias, self.aliases.as_ref()) {
            let alias_key = self
                .entries
                .key_policy()
                .entity_key(route.class, &alias.tenant, Some(&alias.external_id));
            route.cache.evict(&alias_key).await;
        }
    }

    /// Make a newly created entity visible: add its id to the filter and
    /// drop any negative sentinel cached for it. The sentinels are dropped
    /// even when the filter add fails; that error is returned for logging.
    pub async fn record_created(&self, id: &str, alias: Option<&Alias>) -> Result<(), FilterError> {
        let added = match self.filter {
            Some((ref filter, domain)) => filter.add(domain, id).await.map(|_| ()),
            None => Ok(()),
        };
        self.evict(id, alias).await;
        added
    }

    /// Entry cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.entries.stats()
    }

    /// Alias mapping cache counters, if aliases are enabled.
    #[must_use]
    pub fn alias_stats(&self) -> Option<CacheStats> {
        self.aliases.as_ref().map(|route| route.cache.stats())
    }

    async fn fetch_entry(&self, id: &str) -> Result<Lookup<V>, LoadError> {
        let key = self.entry_key(id);
        let loader = &self.loader;
        let fetched = self.entries.fetch(&key, || loader.load(id)).await?;
        Ok(fetched.into())
    }

    /// Is a value (or a negative sentinel) cached for `id`? Does not load.
    pub async fn peek(&self, id: &str) -> Option<Cached<V>> {
        self.entries.lookup(&self.entry_key(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::filter::LocalFilterBackend;
    use crate::policy::KeyPolicy;
    use crate::storage::{DistributedStore, InMemoryStore};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PayOrder {
        pay_order_id: String,
        mch_no: String,
        mch_order_no: String,
        amount: u64,
    }

    impl Identified for PayOrder {
        fn primary_id(&self) -> String {
            self.pay_order_id.clone()
        }
    }

    #[derive(Default)]
    struct OrderTable {
        rows: HashMap<String, PayOrder>,
        loads: AtomicUsize,
        alias_loads: AtomicUsize,
    }

    impl OrderTable {
        fn with(ids: &[&str]) -> Arc<Self> {
            let rows = ids
                .iter()
                .map(|id| {
                    let order = PayOrder {
                        pay_order_id: id.to_string(),
                        mch_no: "M1000001".into(),
                        mch_order_no: format!("MO-{}", id),
                        amount: 100,
                    };
                    (id.to_string(), order)
                })
                .collect();
            Arc::new(Self { rows, ..Default::default() })
        }
    }

    #[async_trait]
    impl EntityLoader<PayOrder> for Arc<OrderTable> {
        async fn load(&self, id: &str) -> Result<Option<PayOrder>, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.get(id).cloned())
        }
    }

    #[async_trait]
    impl AliasLoader<PayOrder> for OrderTable {
        async fn load_by_alias(&self, alias: &Alias) -> Result<Option<PayOrder>, LoadError> {
            self.alias_loads.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .rows
                .values()
                .find(|o| o.mch_no == alias.tenant && o.mch_order_no == alias.external_id)
                .cloned())
        }
    }

    struct Fixture {
        accessor: CacheAsideAccessor<PayOrder, Arc<OrderTable>>,
        table: Arc<OrderTable>,
        filter: Arc<MembershipFilter>,
        store: Arc<InMemoryStore>,
    }

    async fn fixture(ids: &[&str]) -> Fixture {
        let config = CacheConfig::default();
        let keys = Arc::new(KeyPolicy::from_config(&config));
        let store = Arc::new(InMemoryStore::new());
        let l2: Arc<dyn DistributedStore> = store.clone();
        let table = OrderTable::with(ids);

        let filter = Arc::new(MembershipFilter::new(
            Arc::new(LocalFilterBackend::new()),
            keys.clone(),
            Duration::from_millis(100),
        ));
        filter.init(FilterDomain::PayOrder, 1_000, 0.01).await.unwrap();
        let known: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        filter.add_batch(FilterDomain::PayOrder, &known).await;

        let entries = TieredCache::new("pay:order", &config, keys.clone(), Some(l2.clone()));
        let mappings = TieredCache::new("pay:mch_order", &config, keys, Some(l2));
        let alias_loader: Arc<dyn AliasLoader<PayOrder>> = table.clone();
        let accessor = CacheAsideAccessor::new(EntityClass::PayOrder, entries, table.clone())
            .with_filter(filter.clone(), FilterDomain::PayOrder)
            .with_aliases(EntityClass::MerchantOrder, mappings, alias_loader);

        Fixture { accessor, table, filter, store }
    }

    #[tokio::test]
    async fn test_known_id_loads_once() {
        let f = fixture(&["P42"]).await;

        let first = f.accessor.get("P42").await.unwrap();
        let second = f.accessor.get("P42").await.unwrap();

        assert_eq!(first.value().unwrap().pay_order_id, "P42");
        assert!(second.is_found());
        assert_eq!(f.table.loads.load(Ordering::SeqCst), 1);
        assert!(f.store.get("paycache:pay:order:P42").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_filtered_id_never_reaches_cache_or_loader() {
        let f = fixture(&["P42"]).await;

        let result = f.accessor.get("P-never-created").await.unwrap();

        assert_eq!(result.absent_reason(), Some(AbsentReason::Filtered));
        assert_eq!(f.table.loads.load(Ordering::SeqCst), 0);
        assert_eq!(f.accessor.stats().total_requests(), 0);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_false_positive_is_negatively_cached() {
        let f = fixture(&[]).await;
        // In the filter but not in the table: what a false positive looks like
        f.filter.add(FilterDomain::PayOrder, "P-ghost").await.unwrap();

        let first = f.accessor.get("P-ghost").await.unwrap();
        let second = f.accessor.get("P-ghost").await.unwrap();

        assert_eq!(first.absent_reason(), Some(AbsentReason::NotFound));
        assert_eq!(second.absent_reason(), Some(AbsentReason::CachedNegative));
        assert_eq!(f.table.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_identifier_is_absent_without_io() {
        let f = fixture(&["P1"]).await;

        let result = f.accessor.get("  ").await.unwrap();
        assert_eq!(result.absent_reason(), Some(AbsentReason::EmptyIdentifier));
        let result = f.accessor.get_by_alias(&Alias::new("", "MO-P1")).await.unwrap();
        assert_eq!(result.absent_reason(), Some(AbsentReason::EmptyIdentifier));
        assert_eq!(f.table.loads.load(Ordering::SeqCst), 0);
        assert_eq!(f.table.alias_loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_alias_lookup_populates_both_caches() {
        let f = fixture(&["P7"]).await;
        let alias = Alias::new("M1000001", "MO-P7");

        let by_alias = f.accessor.get_by_alias(&alias).await.unwrap();
        assert_eq!(by_alias.value().unwrap().pay_order_id, "P7");

        // Both identifiers are now served without another database trip
        let by_id = f.accessor.get("P7").await.unwrap();
        let again = f.accessor.get_by_alias(&alias).await.unwrap();
        assert!(by_id.is_found() && again.is_found());
        assert_eq!(f.table.alias_loads.load(Ordering::SeqCst), 1);
        assert_eq!(f.table.loads.load(Ordering::SeqCst), 0);

        let mapping = f.store.get("paycache:pay:mch_order:M1000001:MO-P7").await.unwrap();
        assert!(mapping.is_some());
    }

    #[tokio::test]
    async fn test_unknown_alias_is_negatively_cached() {
        let f = fixture(&["P7"]).await;
        let alias = Alias::new("M1000001", "MO-missing");

        let first = f.accessor.get_by_alias(&alias).await.unwrap();
        let second = f.accessor.get_by_alias(&alias).await.unwrap();

        assert_eq!(first.absent_reason(), Some(AbsentReason::NotFound));
        assert_eq!(second.absent_reason(), Some(AbsentReason::CachedNegative));
        assert_eq!(f.table.alias_loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evict_forces_reload_of_entry_and_alias() {
        let f = fixture(&["P9"]).await;
        let alias = Alias::new("M1000001", "MO-P9");

        f.accessor.get_by_alias(&alias).await.unwrap();
        f.accessor.evict("P9", Some(&alias)).await;

        f.accessor.get("P9").await.unwrap();
        f.accessor.get_by_alias(&alias).await.unwrap();
        assert_eq!(f.table.loads.load(Ordering::SeqCst), 1);
        assert_eq!(f.table.alias_loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_record_created_clears_negative_and_filter() {
        let f = fixture(&[]).await;
        f.filter.add(FilterDomain::PayOrder, "P-new").await.unwrap();
        let before = f.accessor.get("P-new").await.unwrap();
        assert_eq!(before.absent_reason(), Some(AbsentReason::NotFound));
        assert!(f.accessor.peek("P-new").await.unwrap().is_absent());

        // A brand-new id, neither filtered in nor cached
        assert_eq!(
            f.accessor.get("P-fresh").await.unwrap().absent_reason(),
            Some(AbsentReason::Filtered)
        );
        f.accessor.record_created("P-fresh", None).await.unwrap();
        f.accessor.record_created("P-new", None).await.unwrap();
        assert!(f.accessor.peek("P-new").await.is_none());
        assert!(f.filter.might_contain(FilterDomain::PayOrder, "P-fresh").await);
    }

    #[tokio::test]
    async fn test_loader_failure_propagates() {
        struct Down;

        #[async_trait]
        impl EntityLoader<PayOrder> for Down {
            async fn load(&self, _id: &str) -> Result<Option<PayOrder>, LoadError> {
                Err(LoadError::source("database unavailable"))
            }
        }

        let config = CacheConfig::default();
        let keys = Arc::new(KeyPolicy::from_config(&config));
        let entries = TieredCache::new("pay:order", &config, keys, None);
        let accessor = CacheAsideAccessor::new(EntityClass::PayOrder, entries, Down);

        let err = accessor.get("P1").await.unwrap_err();
        assert!(err.to_string().contains("database unavailable"));
        assert!(accessor.peek("P1").await.is_none());
    }

    #[tokio::test]
    async fn test_alias_without_route_is_an_error() {
        let config = CacheConfig::default();
        let keys = Arc::new(KeyPolicy::from_config(&config));
        let table = OrderTable::with(&["P1"]);
        let accessor =
            CacheAsideAccessor::new(EntityClass::PayOrder, TieredCache::new("pay:order", &config, keys, None), table);

        assert!(accessor.alias_key(&Alias::new("M1", "MO-1")).is_none());
        assert!(accessor.get_by_alias(&Alias::new("M1", "MO-1")).await.is_err());
    }
}
