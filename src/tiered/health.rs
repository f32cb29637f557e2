// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Distributed-tier health, for operators to spot degraded (L2-less) mode.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Consecutive failures before the tier is reported unhealthy.
const UNHEALTHY_AFTER: u64 = 3;

/// Tracks consecutive L2 failures. One success clears the streak.
#[derive(Debug)]
pub struct L2HealthTracker {
    healthy: AtomicBool,
    failures: AtomicU64,
}

impl L2HealthTracker {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true), // Assume healthy until proven otherwise
            failures: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        if !self.healthy.swap(true, Ordering::AcqRel) {
            crate::metrics::set_backend_healthy("l2", true);
        }
    }

    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= UNHEALTHY_AFTER && self.healthy.swap(false, Ordering::AcqRel) {
            crate::metrics::set_backend_healthy("l2", false);
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }
}

impl Default for L2HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Health snapshot of a tiered cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierHealth {
    pub l1_enabled: bool,
    pub l2_enabled: bool,
    pub l2_healthy: bool,
    pub l2_consecutive_failures: u64,
    pub circuit_rejections: u64,
}

impl TierHealth {
    /// L2 is configured but currently skipped.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.l2_enabled && !self.l2_healthy
    }
}
