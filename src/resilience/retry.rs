// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection retry with exponential backoff.
//!
//! Only used to establish connections at startup. Per-request calls are
//! never retried: a failing tier must degrade to a miss quickly instead of
//! holding the request while we back off.
//!
//! # Example
//!
//! ```
//! use paycache::RetryConfig;
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//! assert_eq!(startup.initial_delay, Duration::from_millis(200));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts, including the first one
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Startup connection: 5 attempts, failing after roughly 3 seconds so a
    /// bad `redis_url` is reported instead of hanging the boot.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Single attempt, no waiting.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Delay before attempt `n + 1`, given the delay before attempt `n`.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or `max_attempts` is used up.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) if attempt >= max_attempts => {
                warn!(operation = operation_name, attempt, error = %err, "Giving up");
                return Err(err);
            }
            Err(err) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
                attempt += 1;
            }
        }
    }
}
