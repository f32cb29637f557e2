//! # paycache
//!
//! Penetration-safe, avalanche-resistant caching for payment-order lookups.
//!
//! ## Architecture
//!
//! Every read passes through up to four stages, cheapest first:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Membership Filter                        │
//! │  • One bloom filter per domain (merchant, app, order, ...)  │
//! │  • "Definitely absent" answers skip everything below        │
//! │  • Fails open when its backend cannot answer                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ maybe
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    L1: In-Process Cache                     │
//! │  • moka, bounded, per-entry expiry                          │
//! │  • Never assumed consistent with other processes            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ miss
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     L2: Redis Cache                         │
//! │  • Shared by all processes, jittered TTLs                   │
//! │  • Timeout + circuit breaker; failures read as misses       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ miss
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    System of Record                         │
//! │  • Caller-supplied loader, the only error source            │
//! │  • Absence is cached as a negative sentinel                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use paycache::{
//!     CacheAsideAccessor, CacheConfig, EntityClass, EntityLoader, KeyPolicy, LoadError,
//!     RedisStore, TieredCache,
//! };
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Order { id: String, amount: u64 }
//!
//! struct Orders;
//!
//! #[async_trait]
//! impl EntityLoader<Order> for Orders {
//!     async fn load(&self, id: &str) -> Result<Option<Order>, LoadError> {
//!         Ok(Some(Order { id: id.to_string(), amount: 100 }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CacheConfig::default();
//!     let keys = Arc::new(KeyPolicy::from_config(&config));
//!     let redis = RedisStore::new("redis://localhost:6379").await.expect("redis");
//!
//!     let entries = TieredCache::new("pay:order", &config, keys, Some(Arc::new(redis)));
//!     let orders = CacheAsideAccessor::new(EntityClass::PayOrder, entries, Orders);
//!
//!     let lookup = orders.get("P1001").await.expect("loader failed");
//!     println!("found: {}", lookup.is_found());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`policy`]: Key namespacing and TTL jitter
//! - [`filter`]: Membership filters, their backends and the warm-up service
//! - [`tiered`]: The two-tier cache
//! - [`accessor`]: Cache-aside lookups by id or alias
//! - [`storage`]: Distributed-tier stores (Redis, memory)
//! - [`source`]: System-of-record interfaces
//! - [`resilience`]: Circuit breaker and connect retry

pub mod accessor;
pub mod config;
pub mod filter;
pub mod metrics;
pub mod policy;
pub mod resilience;
pub mod source;
pub mod storage;
pub mod tiered;

pub use accessor::{AbsentReason, CacheAsideAccessor, Lookup};
pub use config::{CacheConfig, ConfigError};
pub use filter::{
    FilterBackend, FilterDomain, FilterError, FilterHandle, FilterWarmer, LocalFilterBackend,
    MembershipFilter, RedisFilterBackend, WarmupReport,
};
pub use policy::{EntityClass, KeyPolicy, TtlPolicy};
pub use resilience::{CircuitBreaker, CircuitConfig, CircuitError, RetryConfig};
pub use source::{Alias, AliasLoader, EntityLoader, IdentifierSource, Identified, LoadError};
pub use storage::{DistributedStore, InMemoryStore, RedisStore, StorageError};
pub use tiered::{CacheStats, Cached, Fetched, TierHealth, TieredCache};
pub use crate::metrics::LatencyTimer;
