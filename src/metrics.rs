// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for paycache.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `paycache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `cache`: logical cache name (e.g. "pay:order")
//! - `tier`: l1, l2, filter, source
//! - `result` / `outcome` / `status`: what happened

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// CACHE TIERS - Hits and misses
// ═══════════════════════════════════════════════════════════════════════════

/// Record a lookup result on one tier ("hit" or "miss")
pub fn record_cache_lookup(cache: &str, tier: &str, result: &str) {
    counter!(
        "paycache_cache_requests_total",
        "cache" => cache.to_string(),
        "tier" => tier.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record a negative sentinel written to the cache
pub fn record_negative_cached(cache: &str) {
    counter!(
        "paycache_negative_entries_total",
        "cache" => cache.to_string()
    )
    .increment(1);
}

/// Record explicit evictions
pub fn record_eviction(cache: &str, count: usize) {
    counter!(
        "paycache_evictions_total",
        "cache" => cache.to_string()
    )
    .increment(count as u64);
}

/// Set current L1 entry count
pub fn set_l1_entries(cache: &str, count: u64) {
    gauge!(
        "paycache_l1_entries",
        "cache" => cache.to_string()
    )
    .set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYSTEM OF RECORD - Loader invocations
// ═══════════════════════════════════════════════════════════════════════════

/// Record a loader invocation ("found", "absent", "error", "timeout")
pub fn record_load(cache: &str, outcome: &str) {
    counter!(
        "paycache_loads_total",
        "cache" => cache.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMBERSHIP FILTER - Penetration protection
// ═══════════════════════════════════════════════════════════════════════════

/// Record a filter check ("maybe", "absent", "fail_open")
pub fn record_filter_check(domain: &str, result: &str) {
    counter!(
        "paycache_filter_checks_total",
        "domain" => domain.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record a lookup answered "absent" without touching cache or database
pub fn record_penetration_blocked(cache: &str) {
    counter!(
        "paycache_penetration_blocked_total",
        "cache" => cache.to_string()
    )
    .increment(1);
}

/// Set estimated filter entry count
pub fn set_filter_entries(domain: &str, count: u64) {
    gauge!(
        "paycache_filter_entries",
        "domain" => domain.to_string()
    )
    .set(count as f64);
}

/// Record a filter rebuild and how long it took
pub fn record_filter_rebuild(domain: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "paycache_filter_rebuilds_total",
        "domain" => domain.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "paycache_filter_rebuild_seconds",
        "domain" => domain.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with category for alerting
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "paycache_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a timeout
pub fn record_timeout(tier: &str, operation: &str) {
    counter!(
        "paycache_timeouts_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKEND HEALTH - Connection status
// ═══════════════════════════════════════════════════════════════════════════

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "paycache_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker call outcome ("success", "failure", "rejected")
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "paycache_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LATENCY
// ═══════════════════════════════════════════════════════════════════════════

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "paycache_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Records the elapsed time of a scope when dropped.
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
