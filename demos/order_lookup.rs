// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Payment-order lookup example.
//!
//! Demonstrates:
//! 1. Warming the membership filter from the order table
//! 2. Read-through lookups by order id (L1, then L2, then the table)
//! 3. Lookups by merchant order number
//! 4. Enumeration traffic shed by the filter
//! 5. Stats and metrics
//!
//! Runs fully in-process. Set `REDIS_URL` to use a real Redis for the
//! distributed tier and the filters instead.
//!
//! # Run
//!
//! ```bash
//! cargo run --example order_lookup
//! REDIS_URL=redis://localhost:6379 RUST_LOG=paycache=debug cargo run --example order_lookup
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use paycache::{
    Alias, AliasLoader, CacheAsideAccessor, CacheConfig, DistributedStore, EntityClass, EntityLoader,
    FilterBackend, FilterDomain, FilterWarmer, IdentifierSource, Identified, InMemoryStore, KeyPolicy,
    LoadError, LocalFilterBackend, MembershipFilter, RedisFilterBackend, RedisStore, TieredCache,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PayOrder {
    pay_order_id: String,
    mch_no: String,
    mch_order_no: String,
    amount: u64,
    state: u8,
}

impl Identified for PayOrder {
    fn primary_id(&self) -> String {
        self.pay_order_id.clone()
    }
}

/// Stands in for the order table.
struct OrderTable {
    rows: HashMap<String, PayOrder>,
    queries: AtomicUsize,
}

impl OrderTable {
    fn seeded(count: usize) -> Arc<Self> {
        let rows = (0..count)
            .map(|i| {
                let order = PayOrder {
                    pay_order_id: format!("P2026{:08}", i),
                    mch_no: format!("M{}", 1_000_000 + i % 5),
                    mch_order_no: format!("MO-{}", i),
                    amount: 1_000 + i as u64,
                    state: 2,
                };
                (order.pay_order_id.clone(), order)
            })
            .collect();
        Arc::new(Self {
            rows,
            queries: AtomicUsize::new(0),
        })
    }

    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityLoader<PayOrder> for Arc<OrderTable> {
    async fn load(&self, id: &str) -> Result<Option<PayOrder>, LoadError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.get(id).cloned())
    }
}

#[async_trait]
impl AliasLoader<PayOrder> for OrderTable {
    async fn load_by_alias(&self, alias: &Alias) -> Result<Option<PayOrder>, LoadError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rows
            .values()
            .find(|o| o.mch_no == alias.tenant && o.mch_order_no == alias.external_id)
            .cloned())
    }
}

#[async_trait]
impl IdentifierSource for OrderTable {
    async fn count(&self) -> Result<u64, LoadError> {
        Ok(self.rows.len() as u64)
    }

    async fn scan(&self, offset: u64, limit: usize) -> Result<Vec<String>, LoadError> {
        let mut ids: Vec<String> = self.rows.keys().cloned().collect();
        ids.sort();
        Ok(ids.into_iter().skip(offset as usize).take(limit).collect())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("paycache=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║              paycache: Order Lookup Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Backends
    // ─────────────────────────────────────────────────────────────────────────
    let config = CacheConfig::default();
    config.validate()?;
    let keys = Arc::new(KeyPolicy::from_config(&config));

    let (store, filter_backend): (Arc<dyn DistributedStore>, Arc<dyn FilterBackend>) =
        match std::env::var("REDIS_URL") {
            Ok(url) => {
                println!("📦 Using Redis at {}", url);
                (
                    Arc::new(RedisStore::new(&url).await?),
                    Arc::new(RedisFilterBackend::connect(&url).await?),
                )
            }
            Err(_) => {
                println!("📦 Using in-process backends (set REDIS_URL for Redis)");
                (Arc::new(InMemoryStore::new()), Arc::new(LocalFilterBackend::new()))
            }
        };

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Warm the filter
    // ─────────────────────────────────────────────────────────────────────────
    let table = OrderTable::seeded(20_000);
    let filter = Arc::new(MembershipFilter::new(filter_backend, keys.clone(), config.filter.timeout()));
    let warmer = FilterWarmer::new(filter.clone(), config.filter.clone())
        .with_source(FilterDomain::PayOrder, table.clone());

    println!("\n🌱 Warming membership filter...");
    let start = Instant::now();
    let report = warmer.warm_up().await;
    println!("   └─ loaded {} ids in {:?}, complete: {}", report.total_loaded(), start.elapsed(), report.is_complete());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Accessor
    // ─────────────────────────────────────────────────────────────────────────
    let alias_loader: Arc<dyn AliasLoader<PayOrder>> = table.clone();
    let orders = CacheAsideAccessor::new(
        EntityClass::PayOrder,
        TieredCache::new("pay:order", &config, keys.clone(), Some(store.clone())),
        table.clone(),
    )
    .with_filter(filter.clone(), FilterDomain::PayOrder)
    .with_aliases(
        EntityClass::MerchantOrder,
        TieredCache::new("pay:mch_order", &config, keys, Some(store)),
        alias_loader,
    );

    println!("\n🔍 Looking up P202600000042 three times...");
    for round in 1..=3 {
        let start = Instant::now();
        let lookup = orders.get("P202600000042").await?;
        println!(
            "   └─ round {}: amount={:?} in {:?} (table queries so far: {})",
            round,
            lookup.value().map(|o| o.amount),
            start.elapsed(),
            table.queries()
        );
    }

    println!("\n🏷️  Looking up by merchant order number...");
    let alias = Alias::new("M1000002", "MO-7");
    let lookup = orders.get_by_alias(&alias).await?;
    println!("   └─ {} / {} → {:?}", alias.tenant, alias.external_id, lookup.value().map(|o| o.pay_order_id.clone()));
    let lookup = orders.get("P202600000007").await?;
    println!("   └─ same order by id, found: {} (table queries: {})", lookup.is_found(), table.queries());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Enumeration traffic
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛡️  Probing 1000 ids that do not exist...");
    let before = table.queries();
    let mut filtered = 0;
    for i in 0..1_000 {
        let lookup = orders.get(&format!("P2099{:08}", i)).await?;
        if lookup.absent_reason() == Some(paycache::AbsentReason::Filtered) {
            filtered += 1;
        }
    }
    println!("   └─ {} shed by the filter, {} reached the table", filtered, table.queries() - before);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Write path
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n✏️  Order updated, evicting...");
    orders.evict("P202600000007", Some(&alias)).await;
    let lookup = orders.get("P202600000007").await?;
    println!("   └─ reloaded: {} (table queries: {})", lookup.is_found(), table.queries());

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Stats
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 {}", orders.stats());
    if let Some(alias_stats) = orders.alias_stats() {
        println!("   aliases: {}", alias_stats);
    }
    let health = orders.entries().health().await;
    println!("   L2 healthy: {}, degraded: {}", health.l2_healthy, health.is_degraded());

    println!("\n📈 Metrics:");
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter_map(|(key, _, _, value)| match value {
            DebugValue::Counter(v) => Some(format!("{} = {}", key.key().name(), v)),
            DebugValue::Gauge(v) => Some(format!("{} = {}", key.key().name(), v.into_inner())),
            DebugValue::Histogram(_) => None,
        })
        .collect();
    lines.sort();
    lines.dedup();
    for line in lines {
        println!("   └─ {}", line);
    }

    println!();
    Ok(())
}
