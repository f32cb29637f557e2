// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! System-of-record interfaces.
//!
//! The cache core never talks to the database directly. Callers hand it
//! loaders implementing these traits; the core decides what to cache, the
//! loader only reports what exists.
//!
//! - [`EntityLoader`] - point lookup by primary identifier
//! - [`AliasLoader`] - lookup by a secondary (tenant-scoped) identifier
//! - [`IdentifierSource`] - paginated identifier scan for filter warm-up

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by (or on behalf of) the system of record.
///
/// This is the only error class that crosses the cache boundary: cache-tier
/// failures degrade silently, loader failures are surfaced as-is.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("system of record failure: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("loader timed out after {0:?}")]
    Timeout(Duration),
}

impl LoadError {
    /// Wrap any error coming out of a loader.
    pub fn source<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Source(err.into())
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// An entity that knows its own primary identifier.
///
/// Needed for alias lookups: the entity loaded by alias is also written
/// under its canonical key.
pub trait Identified {
    fn primary_id(&self) -> String;
}

/// Secondary identifier: an external id scoped to a tenant
/// (e.g. merchant number + merchant order number).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Alias {
    pub tenant: String,
    pub external_id: String,
}

impl Alias {
    pub fn new(tenant: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            external_id: external_id.into(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tenant.is_empty() || self.external_id.is_empty()
    }
}

impl std::fmt::Display for Alias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant, self.external_id)
    }
}

/// Point lookup against the system of record.
///
/// Must be idempotent and must not touch the cache itself.
#[async_trait]
pub trait EntityLoader<V>: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<V>, LoadError>;
}

/// Lookup by secondary identifier.
#[async_trait]
pub trait AliasLoader<V>: Send + Sync {
    async fn load_by_alias(&self, alias: &Alias) -> Result<Option<V>, LoadError>;
}

/// Paginated identifier scan, used to bulk-load membership filters.
#[async_trait]
pub trait IdentifierSource: Send + Sync {
    /// Total number of identifiers (used for filter sizing).
    async fn count(&self) -> Result<u64, LoadError>;

    /// Return up to `limit` identifiers starting at `offset`.
    /// An empty page means the scan is complete.
    async fn scan(&self, offset: u64, limit: usize) -> Result<Vec<String>, LoadError>;
}

/// Run a loader future under a deadline.
pub async fn load_with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, LoadError>
where
    Fut: Future<Output = Result<T, LoadError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            crate::metrics::record_timeout("source", "load");
            Err(LoadError::Timeout(timeout))
        }
    }
}
