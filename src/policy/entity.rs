// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity classes and their TTL policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const MINUTE: u64 = 60;

/// Class of cached entity. Each class owns a key segment and a TTL policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    MerchantInfo,
    MerchantApp,
    MerchantAppConfig,
    IsvInfo,
    IsvConfig,
    PayIfConfig,
    SysConfig,
    PayOrder,
    /// Alias mapping: (merchant no, merchant order no) -> pay order id
    MerchantOrder,
    RefundOrder,
}

impl EntityClass {
    pub const ALL: [EntityClass; 10] = [
        Self::MerchantInfo,
        Self::MerchantApp,
        Self::MerchantAppConfig,
        Self::IsvInfo,
        Self::IsvConfig,
        Self::PayIfConfig,
        Self::SysConfig,
        Self::PayOrder,
        Self::MerchantOrder,
        Self::RefundOrder,
    ];

    /// Configuration name (snake_case).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MerchantInfo => "merchant_info",
            Self::MerchantApp => "merchant_app",
            Self::MerchantAppConfig => "merchant_app_config",
            Self::IsvInfo => "isv_info",
            Self::IsvConfig => "isv_config",
            Self::PayIfConfig => "pay_if_config",
            Self::SysConfig => "sys_config",
            Self::PayOrder => "pay_order",
            Self::MerchantOrder => "merchant_order",
            Self::RefundOrder => "refund_order",
        }
    }

    /// Business domain segment of the key.
    #[must_use]
    pub fn domain(&self) -> &'static str {
        match self {
            Self::MerchantInfo | Self::MerchantApp | Self::MerchantAppConfig => "mch",
            Self::IsvInfo | Self::IsvConfig => "isv",
            Self::PayIfConfig | Self::PayOrder | Self::MerchantOrder | Self::RefundOrder => "pay",
            Self::SysConfig => "sys",
        }
    }

    /// Entity segment of the key.
    #[must_use]
    pub fn entity(&self) -> &'static str {
        match self {
            Self::MerchantInfo | Self::IsvInfo => "info",
            Self::MerchantApp => "app",
            Self::MerchantAppConfig => "app_config",
            Self::IsvConfig | Self::SysConfig => "config",
            Self::PayIfConfig => "if_config",
            Self::PayOrder => "order",
            Self::MerchantOrder => "mch_order",
            Self::RefundOrder => "refund_order",
        }
    }

    /// Built-in TTL policy, overridable through configuration.
    #[must_use]
    pub fn default_policy(&self) -> TtlPolicy {
        let (base, jitter) = match self {
            Self::MerchantInfo | Self::IsvInfo => (15 * MINUTE, 3 * MINUTE),
            Self::MerchantApp
            | Self::MerchantAppConfig
            | Self::IsvConfig
            | Self::PayIfConfig
            | Self::PayOrder
            | Self::RefundOrder => (30 * MINUTE, 5 * MINUTE),
            Self::SysConfig => (60 * MINUTE, 10 * MINUTE),
            Self::MerchantOrder => (60 * MINUTE, 5 * MINUTE),
        };
        TtlPolicy::from_secs(base, jitter, 5 * MINUTE)
    }
}

impl std::fmt::Display for EntityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.domain(), self.entity())
    }
}

impl std::str::FromStr for EntityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("unknown entity class '{}'", s))
    }
}

/// Expiry policy for one entity class.
///
/// Positive entries live `base_ttl ± jitter` (drawn once per population);
/// negative sentinels live a fixed, shorter `negative_ttl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub base_ttl: Duration,
    pub jitter: Duration,
    pub negative_ttl: Duration,
}

impl TtlPolicy {
    #[must_use]
    pub fn new(base_ttl: Duration, jitter: Duration, negative_ttl: Duration) -> Self {
        Self {
            base_ttl,
            jitter,
            negative_ttl,
        }
    }

    #[must_use]
    pub fn from_secs(base_ttl: u64, jitter: u64, negative_ttl: u64) -> Self {
        Self::new(
            Duration::from_secs(base_ttl),
            Duration::from_secs(jitter),
            Duration::from_secs(negative_ttl),
        )
    }

    /// Inclusive bounds of the effective TTL.
    #[must_use]
    pub fn bounds(&self) -> (Duration, Duration) {
        (
            self.base_ttl.saturating_sub(self.jitter).max(super::MIN_TTL),
            self.base_ttl + self.jitter,
        )
    }
}
