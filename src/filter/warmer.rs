// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filter bootstrap and scheduled rebuild.
//!
//! At startup every registered domain is sized from its current row count
//! (plus growth headroom, never below the domain floor), created if absent
//! and bulk-loaded page by page. A background task can rebuild all filters
//! on a fixed interval to shed deleted ids and re-size for growth.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::membership::MembershipFilter;
use super::{FilterDomain, FilterError};
use crate::config::FilterConfig;
use crate::source::IdentifierSource;

/// Outcome of a warm-up or rebuild pass, per domain.
#[derive(Debug, Default)]
pub struct WarmupReport {
    pub loaded: BTreeMap<String, u64>,
    pub failed: BTreeMap<String, String>,
    /// Domains left alone because another rebuild already held them
    pub skipped: BTreeMap<String, String>,
}

impl WarmupReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    #[must_use]
    pub fn total_loaded(&self) -> u64 {
        self.loaded.values().sum()
    }
}

pub struct FilterWarmer {
    filter: Arc<MembershipFilter>,
    config: FilterConfig,
    sources: Vec<(FilterDomain, Arc<dyn IdentifierSource>)>,
}

impl FilterWarmer {
    pub fn new(filter: Arc<MembershipFilter>, config: FilterConfig) -> Self {
        Self {
            filter,
            config,
            sources: Vec::new(),
        }
    }

    /// Register the identifier source of a domain.
    #[must_use]
    pub fn with_source(mut self, domain: FilterDomain, source: Arc<dyn IdentifierSource>) -> Self {
        self.sources.retain(|(d, _)| *d != domain);
        self.sources.push((domain, source));
        self
    }

    #[must_use]
    pub fn domains(&self) -> Vec<FilterDomain> {
        self.sources.iter().map(|(d, _)| *d).collect()
    }

    /// Create and bulk-load every registered filter.
    ///
    /// A failing domain is logged and reported; the others still load.
    #[tracing::instrument(skip(self))]
    pub async fn warm_up(&self) -> WarmupReport {
        let mut report = WarmupReport::default();
        if !self.config.enabled {
            info!("Membership filters disabled, skipping warm-up");
            return report;
        }

        for (domain, source) in &self.sources {
            match self.warm_domain(*domain, source.as_ref()).await {
                Ok(loaded) => {
                    report.loaded.insert(domain.to_string(), loaded);
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Filter warm-up failed for domain");
                    report.failed.insert(domain.to_string(), e.to_string());
                }
            }
        }

        info!(
            domains = report.loaded.len(),
            failed = report.failed.len(),
            loaded = report.total_loaded(),
            "Membership filter warm-up complete"
        );
        report
    }

    /// Rebuild every registered filter from its source.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_all(&self) -> WarmupReport {
        let mut report = WarmupReport::default();
        for (domain, source) in &self.sources {
            let result = match self.sized(*domain, source.as_ref()).await {
                Ok(expected) => {
                    self.filter
                        .rebuild(
                            *domain,
                            expected,
                            self.config.fpp,
                            source.as_ref(),
                            self.config.warmup_batch_size,
                        )
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(loaded) => {
                    report.loaded.insert(domain.to_string(), loaded);
                }
                Err(e @ FilterError::RebuildInProgress(_)) => {
                    debug!(domain = %domain, "Rebuild skipped, already in progress");
                    report.skipped.insert(domain.to_string(), e.to_string());
                }
                Err(e) => {
                    report.failed.insert(domain.to_string(), e.to_string());
                }
            }
        }
        report
    }

    /// Run `rebuild_all` every `interval` until `shutdown` flips to true.
    pub fn spawn_periodic_rebuild(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately; warm-up already loaded the filters
            ticker.tick().await;
            info!(interval_secs = interval.as_secs(), "Periodic filter rebuild scheduled");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.rebuild_all().await;
                        if !report.is_complete() {
                            error!(failed = ?report.failed, "Periodic filter rebuild incomplete");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Periodic filter rebuild stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn warm_domain(
        &self,
        domain: FilterDomain,
        source: &dyn IdentifierSource,
    ) -> Result<u64, FilterError> {
        let expected = self.sized(domain, source).await?;
        self.filter.init(domain, expected, self.config.fpp).await?;

        let batch_size = self.config.warmup_batch_size.max(1);
        let mut offset = 0u64;
        let mut loaded = 0u64;
        loop {
            let page = source
                .scan(offset, batch_size)
                .await
                .map_err(|e| FilterError::Source(e.to_string()))?;
            if page.is_empty() {
                break;
            }
            self.filter.add_batch(domain, &page).await;
            loaded += page.len() as u64;
            offset += page.len() as u64;
            debug!(domain = %domain, loaded, "Filter warm-up progress");
            if page.len() < batch_size {
                break;
            }
        }

        info!(domain = %domain, loaded, expected, "Filter warmed");
        Ok(loaded)
    }

    async fn sized(&self, domain: FilterDomain, source: &dyn IdentifierSource) -> Result<u64, FilterError> {
        let current = source
            .count()
            .await
            .map_err(|e| FilterError::Source(e.to_string()))?;
        Ok(self.config.expected_insertions(domain, current))
    }
}
