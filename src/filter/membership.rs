// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Membership filter manager.
//!
//! One bloom filter per [`FilterDomain`], stored in an injected
//! [`FilterBackend`]. The manager caches each filter's parameters locally
//! (a [`FilterHandle`]) so a check is a single backend round trip.
//!
//! Answers:
//! - `might_contain == false` → the id was never added, skip cache and DB
//! - `might_contain == true` → maybe, continue down the normal path
//!
//! Any backend error, timeout or missing filter answers `true` (fail open).
//!
//! ## Rebuild
//!
//! `rebuild` fills a staging filter `<name>:rebuild:<owner>` from an
//! [`IdentifierSource`] and atomically swaps it over the live one. While
//! the rebuild runs, `add` writes to both filters, so ids created in the
//! meantime are not lost. If loading fails the staging filter is dropped
//! and the live filter stays untouched.
//!
//! Only one rebuild per filter runs at a time: a local claim covers this
//! process, the backend lock `<name>:rebuild:lock` covers every process
//! sharing the backend. A second rebuild gets `RebuildInProgress`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use super::backend::FilterBackend;
use super::bloom::BloomParams;
use super::{FilterDomain, FilterError};
use crate::policy::KeyPolicy;
use crate::source::IdentifierSource;

/// Elements per backend call in `add_batch`.
const BATCH_CHUNK: usize = 500;

/// Upper bound on how long a crashed rebuild blocks the next one.
const REBUILD_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

/// Local view of one filter: where it lives and how it is shaped.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterHandle {
    domain: FilterDomain,
    name: String,
    params: BloomParams,
}

impl FilterHandle {
    #[must_use]
    pub fn domain(&self) -> FilterDomain {
        self.domain
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn params(&self) -> BloomParams {
        self.params
    }
}

pub struct MembershipFilter {
    backend: Arc<dyn FilterBackend>,
    keys: Arc<KeyPolicy>,
    handles: DashMap<FilterDomain, FilterHandle>,
    /// Rebuilds in progress, with their staging filter once it exists
    rebuilding: DashMap<FilterDomain, Option<FilterHandle>>,
    timeout: Duration,
}

impl MembershipFilter {
    pub fn new(backend: Arc<dyn FilterBackend>, keys: Arc<KeyPolicy>, timeout: Duration) -> Self {
        Self {
            backend,
            keys,
            handles: DashMap::new(),
            rebuilding: DashMap::new(),
            timeout,
        }
    }

    /// Create the filter for `domain`, or return the existing one.
    ///
    /// If another process already created it, its stored parameters win.
    pub async fn init(
        &self,
        domain: FilterDomain,
        expected: u64,
        fpp: f64,
    ) -> Result<FilterHandle, FilterError> {
        if let Some(handle) = self.handles.get(&domain) {
            return Ok(handle.clone());
        }

        let params = BloomParams::optimal(expected, fpp)?;
        let name = self.keys.filter_key(domain);
        let created = self.timed("init", self.backend.try_init(&name, &params)).await?;

        let params = if created {
            params
        } else {
            self.timed("params", self.backend.params(&name))
                .await?
                .unwrap_or(params)
        };

        info!(
            domain = %domain,
            filter = %name,
            created,
            size_bits = params.size_bits,
            hashes = params.hashes,
            expected = params.expected,
            "Membership filter ready"
        );

        let handle = FilterHandle { domain, name, params };
        Ok(self.handles.entry(domain).or_insert(handle).clone())
    }

    /// Local handle, if `init` ran (or the filter was discovered).
    #[must_use]
    pub fn handle(&self, domain: FilterDomain) -> Option<FilterHandle> {
        self.handles.get(&domain).map(|h| h.clone())
    }

    #[must_use]
    pub fn is_rebuilding(&self, domain: FilterDomain) -> bool {
        self.rebuilding.contains_key(&domain)
    }

    /// Record one element. Returns whether it was new to the filter.
    pub async fn add(&self, domain: FilterDomain, element: &str) -> Result<bool, FilterError> {
        if let Some(staging) = self.staging(domain) {
            if let Err(e) = self.timed("add", self.backend.add(&staging.name, &staging.params, element)).await {
                warn!(domain = %domain, error = %e, "Failed to mirror add into rebuilding filter");
            }
        }

        let handle = self.resolve(domain).await?;
        match self.timed("add", self.backend.add(&handle.name, &handle.params, element)).await {
            Err(FilterError::ConfigMismatch { .. }) => {
                let handle = self.refresh(domain).await?;
                self.timed("add", self.backend.add(&handle.name, &handle.params, element)).await
            }
            other => other,
        }
    }

    /// Best-effort bulk add; a failed chunk is logged and skipped.
    ///
    /// Returns how many elements were new to the filter.
    pub async fn add_batch(&self, domain: FilterDomain, elements: &[String]) -> u64 {
        if elements.is_empty() {
            return 0;
        }
        let handle = match self.resolve(domain).await {
            Ok(h) => h,
            Err(e) => {
                warn!(domain = %domain, count = elements.len(), error = %e, "Batch add skipped");
                crate::metrics::record_error("filter", "add_batch", "unavailable");
                return 0;
            }
        };
        let staging = self.staging(domain);

        let mut added = 0;
        for chunk in elements.chunks(BATCH_CHUNK) {
            if let Some(ref staging) = staging {
                if let Err(e) = self
                    .timed("add_batch", self.backend.add_batch(&staging.name, &staging.params, chunk))
                    .await
                {
                    warn!(domain = %domain, error = %e, "Failed to mirror batch into rebuilding filter");
                }
            }
            match self
                .timed("add_batch", self.backend.add_batch(&handle.name, &handle.params, chunk))
                .await
            {
                Ok(n) => added += n,
                Err(e) => {
                    warn!(domain = %domain, chunk = chunk.len(), error = %e, "Batch add chunk failed");
                    crate::metrics::record_error("filter", "add_batch", "backend");
                }
            }
        }
        debug!(domain = %domain, submitted = elements.len(), added, "Batch added to filter");
        added
    }

    /// Might `element` have been added? Never errs: unsure means `true`.
    pub async fn might_contain(&self, domain: FilterDomain, element: &str) -> bool {
        let label = domain.segment();
        let handle = match self.resolve(domain).await {
            Ok(h) => h,
            Err(FilterError::NotFound(_)) => {
                debug!(domain = %domain, "No filter for domain, failing open");
                crate::metrics::record_filter_check(label, "fail_open");
                return true;
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Filter backend unavailable, failing open");
                crate::metrics::record_filter_check(label, "fail_open");
                return true;
            }
        };

        match self
            .timed("contains", self.backend.contains(&handle.name, &handle.params, element))
            .await
        {
            Ok(true) => {
                crate::metrics::record_filter_check(label, "maybe");
                true
            }
            Ok(false) => {
                crate::metrics::record_filter_check(label, "absent");
                false
            }
            Err(FilterError::ConfigMismatch { .. }) => {
                warn!(domain = %domain, "Filter parameters changed underneath us, refreshing");
                if let Err(e) = self.refresh(domain).await {
                    warn!(domain = %domain, error = %e, "Filter refresh failed");
                }
                crate::metrics::record_filter_check(label, "fail_open");
                true
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Filter check failed, failing open");
                crate::metrics::record_filter_check(label, "fail_open");
                true
            }
        }
    }

    /// Approximate number of distinct elements in the filter.
    pub async fn count(&self, domain: FilterDomain) -> Result<u64, FilterError> {
        let handle = self.resolve(domain).await?;
        let bits = self.timed("count", self.backend.bits_set(&handle.name)).await?;
        let count = handle.params.estimate_count(bits);
        crate::metrics::set_filter_entries(domain.segment(), count);
        Ok(count)
    }

    /// Drop the filter. Subsequent checks fail open until it is re-created.
    pub async fn delete(&self, domain: FilterDomain) -> Result<(), FilterError> {
        let name = self.keys.filter_key(domain);
        self.timed("delete", self.backend.delete(&name)).await?;
        self.handles.remove(&domain);
        info!(domain = %domain, filter = %name, "Membership filter deleted");
        Ok(())
    }

    /// Replace the filter with a freshly loaded one sized for `expected`.
    ///
    /// Returns the number of identifiers loaded. On failure the previous
    /// filter stays in place. Fails with `RebuildInProgress` while another
    /// rebuild of the same filter runs, here or in another process.
    #[tracing::instrument(skip(self, source, domain), fields(domain = %domain))]
    pub async fn rebuild(
        &self,
        domain: FilterDomain,
        expected: u64,
        fpp: f64,
        source: &dyn IdentifierSource,
        batch_size: usize,
    ) -> Result<u64, FilterError> {
        let start = Instant::now();
        let params = BloomParams::optimal(expected, fpp)?;
        let name = self.keys.filter_key(domain);

        let mut claim = RebuildClaim::take(&self.rebuilding, domain)
            .ok_or_else(|| FilterError::RebuildInProgress(name.clone()))?;

        let owner = format!("{:016x}", rand::random::<u64>());
        let lock = format!("{}:rebuild:lock", name);
        if !self.timed("lock", self.backend.try_lock(&lock, &owner, REBUILD_LOCK_TTL)).await? {
            info!(domain = %domain, filter = %name, "Filter rebuild already running elsewhere, skipping");
            return Err(FilterError::RebuildInProgress(name));
        }

        let staging = FilterHandle {
            domain,
            name: format!("{}:rebuild:{}", name, owner),
            params,
        };
        claim.pending = Some(PendingCleanup {
            backend: Arc::clone(&self.backend),
            lock: lock.clone(),
            owner: owner.clone(),
            staging: staging.name.clone(),
        });

        let result = self.build_and_swap(&claim, &staging, &name, source, batch_size.max(1)).await;
        claim.unstage();

        if result.is_err() {
            if let Err(cleanup) = self.timed("delete", self.backend.delete(&staging.name)).await {
                warn!(domain = %domain, error = %cleanup, "Failed to drop staging filter");
            }
        }
        if let Err(e) = self.timed("unlock", self.backend.unlock(&lock, &owner)).await {
            warn!(domain = %domain, error = %e, "Failed to release rebuild lock, it expires on its own");
        }
        claim.pending = None;

        match result {
            Ok(loaded) => {
                self.handles.insert(
                    domain,
                    FilterHandle {
                        domain,
                        name: name.clone(),
                        params,
                    },
                );
                crate::metrics::record_filter_rebuild(domain.segment(), true, start.elapsed());
                crate::metrics::set_filter_entries(domain.segment(), loaded);
                info!(
                    domain = %domain,
                    loaded,
                    size_bits = params.size_bits,
                    hashes = params.hashes,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Membership filter rebuilt"
                );
                Ok(loaded)
            }
            Err(e) => {
                crate::metrics::record_filter_rebuild(domain.segment(), false, start.elapsed());
                error!(domain = %domain, error = %e, "Filter rebuild failed, keeping previous filter");
                Err(e)
            }
        }
    }

    /// Ping the backend.
    pub async fn health(&self) -> bool {
        let healthy = self.timed("ping", self.backend.ping()).await.is_ok();
        crate::metrics::set_backend_healthy("filter", healthy);
        healthy
    }

    async fn build_and_swap(
        &self,
        claim: &RebuildClaim<'_>,
        staging: &FilterHandle,
        live_name: &str,
        source: &dyn IdentifierSource,
        batch_size: usize,
    ) -> Result<u64, FilterError> {
        self.timed("init", self.backend.try_init(&staging.name, &staging.params)).await?;
        // Adds from here on are mirrored; earlier ones are in the source already
        claim.stage(staging.clone());

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
            // A partial staging filter would yield false negatives: abort on any failure
            self.timed(
                "add_batch",
                self.backend.add_batch(&staging.name, &staging.params, &page),
            )
            .await?;
            loaded += page.len() as u64;
            offset += page.len() as u64;
            if page.len() < batch_size {
                break;
            }
        }
        self.timed("replace", self.backend.replace(&staging.name, live_name)).await?;
        Ok(loaded)
    }

    fn staging(&self, domain: FilterDomain) -> Option<FilterHandle> {
        self.rebuilding.get(&domain).and_then(|h| h.clone())
    }

    /// Local handle, or discover a filter created by another process.
    async fn resolve(&self, domain: FilterDomain) -> Result<FilterHandle, FilterError> {
        match self.handle(domain) {
            Some(handle) => Ok(handle),
            None => self.refresh(domain).await,
        }
    }

    /// Reload the handle from the backend's stored parameters.
    async fn refresh(&self, domain: FilterDomain) -> Result<FilterHandle, FilterError> {
        let name = self.keys.filter_key(domain);
        match self.timed("params", self.backend.params(&name)).await? {
            Some(params) => {
                let handle = FilterHandle { domain, name, params };
                self.handles.insert(domain, handle.clone());
                Ok(handle)
            }
            None => {
                self.handles.remove(&domain);
                Err(FilterError::NotFound(name))
            }
        }
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T, FilterError>
    where
        F: Future<Output = Result<T, FilterError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                crate::metrics::record_timeout("filter", operation);
                Err(FilterError::Timeout(self.timeout))
            }
        }
    }
}

/// Marks a domain as rebuilding in this process. Released on drop, so a
/// failed or cancelled rebuild never leaves the domain claimed.
struct RebuildClaim<'a> {
    rebuilding: &'a DashMap<FilterDomain, Option<FilterHandle>>,
    domain: FilterDomain,
    /// Backend state to release if the rebuild is dropped mid-way
    pending: Option<PendingCleanup>,
}

struct PendingCleanup {
    backend: Arc<dyn FilterBackend>,
    lock: String,
    owner: String,
    staging: String,
}

impl<'a> RebuildClaim<'a> {
    fn take(rebuilding: &'a DashMap<FilterDomain, Option<FilterHandle>>, domain: FilterDomain) -> Option<Self> {
        match rebuilding.entry(domain) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(None);
                Some(Self {
                    rebuilding,
                    domain,
                    pending: None,
                })
            }
        }
    }

    /// Start mirroring adds into `staging`.
    fn stage(&self, staging: FilterHandle) {
        if let Some(mut slot) = self.rebuilding.get_mut(&self.domain) {
            *slot = Some(staging);
        }
    }

    fn unstage(&self) {
        if let Some(mut slot) = self.rebuilding.get_mut(&self.domain) {
            *slot = None;
        }
    }
}

impl Drop for RebuildClaim<'_> {
    fn drop(&mut self) {
        self.rebuilding.remove(&self.domain);

        let Some(cleanup) = self.pending.take() else {
            return;
        };
        warn!(domain = %self.domain, staging = %cleanup.staging, "Filter rebuild cancelled, releasing its lock");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = cleanup.backend.delete(&cleanup.staging).await {
                    warn!(staging = %cleanup.staging, error = %e, "Failed to drop staging filter");
                }
                if let Err(e) = cleanup.backend.unlock(&cleanup.lock, &cleanup.owner).await {
                    warn!(lock = %cleanup.lock, error = %e, "Failed to release rebuild lock, it expires on its own");
                }
            });
        }
    }
}
