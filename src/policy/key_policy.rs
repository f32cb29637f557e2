// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Namespaced key construction and TTL resolution.
//!
//! Key format: `<namespace>:<domain>:<entity>:<identifier>[:<subkey>]`.
//! The namespace keeps our keys apart from unrelated systems sharing the
//! same Redis.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use super::entity::{EntityClass, TtlPolicy};
use super::MIN_TTL;
use crate::config::CacheConfig;
use crate::filter::FilterDomain;

#[derive(Debug, Clone)]
pub struct KeyPolicy {
    namespace: String,
    policies: HashMap<EntityClass, TtlPolicy>,
}

impl KeyPolicy {
    /// Policy with built-in TTLs for every entity class.
    pub fn new(namespace: impl Into<String>) -> Self {
        let policies = EntityClass::ALL
            .iter()
            .map(|class| (*class, class.default_policy()))
            .collect();
        Self {
            namespace: namespace.into(),
            policies,
        }
    }

    /// Policy from configuration: namespace plus per-entity overrides.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        let mut policy = Self::new(config.key_prefix.clone());
        for (class, ttl) in config.entity_overrides() {
            policy.policies.insert(class, ttl);
        }
        policy
    }

    /// Replace the TTL policy of one class.
    #[must_use]
    pub fn with_policy(mut self, class: EntityClass, policy: TtlPolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Build a fully qualified key.
    #[must_use]
    pub fn build_key(&self, domain: &str, entity: &str, identifier: &str, subkey: Option<&str>) -> String {
        match subkey {
            Some(sub) => format!("{}:{}:{}:{}:{}", self.namespace, domain, entity, identifier, sub),
            None => format!("{}:{}:{}:{}", self.namespace, domain, entity, identifier),
        }
    }

    /// Build the key of an entity class instance.
    #[must_use]
    pub fn entity_key(&self, class: EntityClass, identifier: &str, subkey: Option<&str>) -> String {
        self.build_key(class.domain(), class.entity(), identifier, subkey)
    }

    /// Name of the membership filter for a domain.
    #[must_use]
    pub fn filter_key(&self, domain: FilterDomain) -> String {
        format!("{}:bloom:{}", self.namespace, domain.segment())
    }

    /// Prefix the namespace unless the key already carries it.
    #[must_use]
    pub fn qualify<'a>(&self, key: &'a str) -> Cow<'a, str> {
        let ns = self.namespace.as_str();
        if key.len() > ns.len() && key.starts_with(ns) && key.as_bytes()[ns.len()] == b':' {
            Cow::Borrowed(key)
        } else {
            Cow::Owned(format!("{}:{}", ns, key))
        }
    }

    #[must_use]
    pub fn policy(&self, class: EntityClass) -> TtlPolicy {
        self.policies
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_policy())
    }

    /// Effective TTL for one cache population: `base ± uniform(jitter)`.
    ///
    /// Call once when the entry is written, never on access.
    #[must_use]
    pub fn resolve_ttl(&self, class: EntityClass) -> Duration {
        let policy = self.policy(class);
        jittered(policy.base_ttl, policy.jitter)
    }

    /// Fixed TTL for negative sentinels of a class.
    #[must_use]
    pub fn resolve_negative_ttl(&self, class: EntityClass) -> Duration {
        self.policy(class).negative_ttl
    }
}

/// Draw a TTL uniformly from `[base - jitter, base + jitter]`, floored at [`MIN_TTL`].
#[must_use]
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base.max(MIN_TTL);
    }
    let base_ms = base.as_millis() as u64;
    let jitter_ms = jitter.as_millis() as u64;
    let offset = rand::thread_rng().gen_range(0..=jitter_ms.saturating_mul(2));
    let ttl_ms = base_ms.saturating_add(offset).saturating_sub(jitter_ms);
    Duration::from_millis(ttl_ms).max(MIN_TTL)
}
