// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker for the distributed tier, built on `recloser`.
//!
//! When Redis is down every call would otherwise wait for its timeout.
//! Once enough recent calls fail the breaker opens and calls are rejected
//! immediately; the cache treats a rejection like any other L2 miss.
//!
//! States:
//! - Closed: calls pass through
//! - Open: calls fail fast for `recovery_timeout`
//! - HalfOpen: `success_threshold` trial calls decide whether to close

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use tracing::{debug, warn};

/// Failure ratio over the closed-state window that trips the breaker.
const TRIP_RATIO: f32 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Size of the closed-state window; the breaker trips when half of the
    /// last `failure_threshold` calls failed
    pub failure_threshold: u32,
    /// Calls let through while half-open
    pub success_threshold: u32,
    /// How long to stay open before probing
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    /// Lenient: the guarded tier is only a cache, the loader is the truth.
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
        }
    }
}

/// A named circuit breaker that counts its outcomes.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(TRIP_RATIO)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the breaker. The returned future is only polled
    /// when the circuit lets the call through.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                let rejected = self.rejections.fetch_add(1, Ordering::Relaxed) + 1;
                // One line per hundred rejections is plenty while the tier is down
                if rejected % 100 == 1 {
                    warn!(circuit = %self.name, rejected, "Circuit open, rejecting calls");
                }
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}
