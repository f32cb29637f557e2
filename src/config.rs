//! Configuration for the cache core.
//!
//! # Example
//!
//! ```
//! use paycache::CacheConfig;
//!
//! // Minimal config (uses defaults)
//! let config = CacheConfig::default();
//! assert_eq!(config.l1.max_capacity, 5000);
//! assert!(config.cache_null_values);
//!
//! // From TOML
//! let config = CacheConfig::from_toml_str(r#"
//!     key_prefix = "jeepay"
//!     redis_url = "redis://localhost:6379"
//!
//!     [l1]
//!     max_capacity = 20000
//!
//!     [filter]
//!     fpp = 0.001
//! "#).unwrap();
//! assert_eq!(config.key_prefix, "jeepay");
//! assert_eq!(config.l1.max_capacity, 20000);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::filter::FilterDomain;
use crate::policy::{EntityClass, TtlPolicy};
use crate::resilience::circuit_breaker::CircuitConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the two cache tiers, the membership filters and the
/// per-entity TTL policies.
///
/// All fields have defaults. Configure `redis_url` for multi-process use;
/// without it the distributed tier must be supplied explicitly.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Namespace prepended to every key (default: "paycache")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Store a negative sentinel when the loader finds nothing
    #[serde(default = "default_true")]
    pub cache_null_values: bool,

    /// Redis connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Deadline for one system-of-record load
    #[serde(default = "default_loader_timeout_ms")]
    pub loader_timeout_ms: u64,

    #[serde(default)]
    pub l1: L1Config,

    #[serde(default)]
    pub l2: L2Config,

    #[serde(default)]
    pub filter: FilterConfig,

    /// Per-entity TTL overrides, keyed by entity class name (e.g. "pay_order")
    #[serde(default)]
    pub entities: HashMap<String, EntityTtlConfig>,
}

/// In-process tier.
#[derive(Debug, Clone, Deserialize)]
pub struct L1Config {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_l1_max_capacity")]
    pub max_capacity: u64,
    #[serde(default = "default_l1_initial_capacity")]
    pub initial_capacity: usize,
    #[serde(default = "default_l1_expire_after_write_secs")]
    pub expire_after_write_secs: u64,
    #[serde(default = "default_l1_expire_after_access_secs")]
    pub expire_after_access_secs: u64,
}

/// Distributed (Redis) tier.
#[derive(Debug, Clone, Deserialize)]
pub struct L2Config {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// TTL used when a cache has no entity policy
    #[serde(default = "default_l2_default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Negative TTL used when a cache has no entity policy
    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,
    /// Per-call deadline; an expired call counts as a miss
    #[serde(default = "default_l2_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_success_threshold")]
    pub circuit_success_threshold: u32,
    #[serde(default = "default_circuit_recovery_timeout_secs")]
    pub circuit_recovery_timeout_secs: u64,
}

/// Membership filters.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Target false-positive probability
    #[serde(default = "default_fpp")]
    pub fpp: f64,
    /// Headroom over the current row count when sizing a filter
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    /// Identifiers per page during warm-up/rebuild
    #[serde(default = "default_warmup_batch_size")]
    pub warmup_batch_size: usize,
    /// Periodic rebuild interval (0 = disabled)
    #[serde(default = "default_rebuild_interval_secs")]
    pub rebuild_interval_secs: u64,
    /// Per-call deadline for filter backend operations
    #[serde(default = "default_filter_timeout_ms")]
    pub timeout_ms: u64,
    /// Floor for expected insertions, keyed by domain name (e.g. "merchant_no")
    #[serde(default)]
    pub min_expected_insertions: HashMap<String, u64>,
}

/// TTL override for one entity class, in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EntityTtlConfig {
    pub base_ttl_secs: u64,
    #[serde(default)]
    pub jitter_secs: u64,
    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,
}

impl EntityTtlConfig {
    #[must_use]
    pub fn to_policy(&self) -> TtlPolicy {
        TtlPolicy::from_secs(self.base_ttl_secs, self.jitter_secs, self.negative_ttl_secs)
    }
}

fn default_true() -> bool { true }
fn default_key_prefix() -> String { "paycache".to_string() }
fn default_loader_timeout_ms() -> u64 { 3_000 }
fn default_l1_max_capacity() -> u64 { 5_000 }
fn default_l1_initial_capacity() -> usize { 500 }
fn default_l1_expire_after_write_secs() -> u64 { 10 * 60 }
fn default_l1_expire_after_access_secs() -> u64 { 30 * 60 }
fn default_l2_default_ttl_secs() -> u64 { 30 * 60 }
fn default_negative_ttl_secs() -> u64 { 5 * 60 }
fn default_l2_timeout_ms() -> u64 { 250 }
fn default_circuit_failure_threshold() -> u32 { 10 }
fn default_circuit_success_threshold() -> u32 { 1 }
fn default_circuit_recovery_timeout_secs() -> u64 { 15 }
fn default_fpp() -> f64 { 0.01 }
fn default_growth_factor() -> f64 { 1.2 }
fn default_warmup_batch_size() -> usize { 1_000 }
fn default_rebuild_interval_secs() -> u64 { 24 * 60 * 60 }
fn default_filter_timeout_ms() -> u64 { 100 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            cache_null_values: true,
            redis_url: None,
            loader_timeout_ms: default_loader_timeout_ms(),
            l1: L1Config::default(),
            l2: L2Config::default(),
            filter: FilterConfig::default(),
            entities: HashMap::new(),
        }
    }
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            enabled: true,
            max_capacity: default_l1_max_capacity(),
            initial_capacity: default_l1_initial_capacity(),
            expire_after_write_secs: default_l1_expire_after_write_secs(),
            expire_after_access_secs: default_l1_expire_after_access_secs(),
        }
    }
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: default_l2_default_ttl_secs(),
            negative_ttl_secs: default_negative_ttl_secs(),
            timeout_ms: default_l2_timeout_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_success_threshold: default_circuit_success_threshold(),
            circuit_recovery_timeout_secs: default_circuit_recovery_timeout_secs(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fpp: default_fpp(),
            growth_factor: default_growth_factor(),
            warmup_batch_size: default_warmup_batch_size(),
            rebuild_interval_secs: default_rebuild_interval_secs(),
            timeout_ms: default_filter_timeout_ms(),
            min_expected_insertions: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() || self.key_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!("key_prefix {:?} must be non-empty without whitespace", self.key_prefix)));
        }
        if !(self.filter.fpp > 0.0 && self.filter.fpp < 1.0) {
            return Err(ConfigError::Invalid(format!("filter.fpp must be in (0, 1), got {}", self.filter.fpp)));
        }
        if self.filter.growth_factor < 1.0 {
            return Err(ConfigError::Invalid(format!("filter.growth_factor must be >= 1, got {}", self.filter.growth_factor)));
        }
        if self.filter.warmup_batch_size == 0 {
            return Err(ConfigError::Invalid("filter.warmup_batch_size must be > 0".into()));
        }
        if self.l1.enabled && self.l1.max_capacity == 0 {
            return Err(ConfigError::Invalid("l1.max_capacity must be > 0 when l1 is enabled".into()));
        }
        for name in self.entities.keys() {
            name.parse::<EntityClass>().map_err(ConfigError::Invalid)?;
        }
        for name in self.filter.min_expected_insertions.keys() {
            name.parse::<FilterDomain>().map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }

    /// Entity TTL overrides with parsed class names; unknown names are skipped.
    pub fn entity_overrides(&self) -> impl Iterator<Item = (EntityClass, TtlPolicy)> + '_ {
        self.entities
            .iter()
            .filter_map(|(name, ttl)| name.parse().ok().map(|class| (class, ttl.to_policy())))
    }

    #[must_use]
    pub fn loader_timeout(&self) -> Duration {
        Duration::from_millis(self.loader_timeout_ms)
    }
}

impl L1Config {
    #[must_use]
    pub fn expire_after_write(&self) -> Duration {
        Duration::from_secs(self.expire_after_write_secs)
    }

    #[must_use]
    pub fn expire_after_access(&self) -> Duration {
        Duration::from_secs(self.expire_after_access_secs)
    }
}

impl L2Config {
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    #[must_use]
    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn circuit(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: self.circuit_success_threshold,
            recovery_timeout: Duration::from_secs(self.circuit_recovery_timeout_secs),
        }
    }
}

impl FilterConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn rebuild_interval(&self) -> Option<Duration> {
        (self.rebuild_interval_secs > 0).then(|| Duration::from_secs(self.rebuild_interval_secs))
    }

    /// Expected insertions for a domain: current size plus headroom, never
    /// below the domain floor.
    #[must_use]
    pub fn expected_insertions(&self, domain: FilterDomain, current: u64) -> u64 {
        let floor = self
            .min_expected_insertions
            .get(domain.as_str())
            .copied()
            .unwrap_or_else(|| domain.default_min_insertions());
        let grown = (current as f64 * self.growth_factor).ceil() as u64;
        grown.max(floor).max(1)
    }
}
