// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-domain membership filters.
//!
//! A bloom filter per identifier domain answers "might this id exist"
//! before any cache or database access. It never reports a false negative
//! for an element added since the last rebuild, and when the backing store
//! cannot answer it says "maybe" (fail open) so real requests fall through
//! to the normal path.

pub mod backend;
pub mod bloom;
pub mod membership;
pub mod redis_backend;
pub mod warmer;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use backend::{FilterBackend, LocalFilterBackend};
pub use bloom::BloomParams;
pub use membership::{FilterHandle, MembershipFilter};
pub use redis_backend::RedisFilterBackend;
pub use warmer::{FilterWarmer, WarmupReport};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("filter backend error: {0}")]
    Backend(String),
    #[error("filter '{0}' not found")]
    NotFound(String),
    #[error("invalid filter parameters: {0}")]
    InvalidParams(String),
    #[error("filter '{name}' was re-created with different parameters")]
    ConfigMismatch { name: String },
    #[error("filter operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("identifier source failed: {0}")]
    Source(String),
    /// Another rebuild of the same filter holds it, here or in another process
    #[error("rebuild of '{0}' already in progress")]
    RebuildInProgress(String),
}

impl From<redis::RedisError> for FilterError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Identifier domain with its own filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDomain {
    MerchantNo,
    MerchantApp,
    IsvNo,
    PayOrder,
    RefundOrder,
}

impl FilterDomain {
    pub const ALL: [FilterDomain; 5] = [
        Self::MerchantNo,
        Self::MerchantApp,
        Self::IsvNo,
        Self::PayOrder,
        Self::RefundOrder,
    ];

    /// Configuration name (snake_case).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MerchantNo => "merchant_no",
            Self::MerchantApp => "merchant_app",
            Self::IsvNo => "isv_no",
            Self::PayOrder => "pay_order",
            Self::RefundOrder => "refund_order",
        }
    }

    /// Key segment of the filter name.
    #[must_use]
    pub fn segment(&self) -> &'static str {
        match self {
            Self::MerchantNo => "mch:no",
            Self::MerchantApp => "mch:app",
            Self::IsvNo => "isv:no",
            Self::PayOrder => "pay:order",
            Self::RefundOrder => "refund:order",
        }
    }

    /// Smallest filter we size for, whatever the current row count.
    #[must_use]
    pub fn default_min_insertions(&self) -> u64 {
        match self {
            Self::MerchantNo => 100_000,
            Self::MerchantApp => 50_000,
            Self::IsvNo => 10_000,
            Self::PayOrder => 1_000_000,
            Self::RefundOrder => 200_000,
        }
    }
}

impl std::fmt::Display for FilterDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.segment())
    }
}

impl std::str::FromStr for FilterDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|domain| domain.as_str() == s)
            .ok_or_else(|| format!("unknown filter domain '{}'", s))
    }
}
