// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time hit/miss counters of one cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    /// `(l1_hits + l2_hits) / all lookups`, 0 when nothing was looked up
    pub total_hit_rate: f64,
}

impl CacheStats {
    #[must_use]
    pub fn total_hits(&self) -> u64 {
        self.l1_hits + self.l2_hits
    }

    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.l1_hits + self.l1_misses + self.l2_hits + self.l2_misses
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CacheStats{{L1: {}/{}, L2: {}/{}, Total: {}/{} ({:.2}% hit rate)}}",
            self.l1_hits,
            self.l1_hits + self.l1_misses,
            self.l2_hits,
            self.l2_hits + self.l2_misses,
            self.total_hits(),
            self.total_requests(),
            self.total_hit_rate * 100.0
        )
    }
}

/// Monotonic counters, safe to bump from any thread.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn l1(&self, hit: bool) {
        let counter = if hit { &self.l1_hits } else { &self.l1_misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn l2(&self, hit: bool) {
        let counter = if hit { &self.l2_hits } else { &self.l2_misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        let l1_hits = self.l1_hits.load(Ordering::Relaxed);
        let l1_misses = self.l1_misses.load(Ordering::Relaxed);
        let l2_hits = self.l2_hits.load(Ordering::Relaxed);
        let l2_misses = self.l2_misses.load(Ordering::Relaxed);
        let total = l1_hits + l1_misses + l2_hits + l2_misses;
        let total_hit_rate = if total == 0 {
            0.0
        } else {
            (l1_hits + l2_hits) as f64 / total as f64
        };
        CacheStats {
            l1_hits,
            l1_misses,
            l2_hits,
            l2_misses,
            total_hit_rate,
        }
    }
}
