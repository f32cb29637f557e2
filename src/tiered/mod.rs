// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! L1 (in-process) + L2 (distributed) cache with TTL jitter and negative
//! caching.

pub mod cache;
pub mod entry;
pub mod health;
pub mod stats;

pub use cache::{Fetched, TieredCache};
pub use entry::Cached;
pub use health::{L2HealthTracker, TierHealth};
pub use stats::CacheStats;
