// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key namespacing and TTL-with-jitter policy.
//!
//! Jitter spreads expiry of entries populated together, so a burst of
//! writes does not turn into a burst of simultaneous misses later.

pub mod entity;
pub mod key_policy;

use std::time::Duration;

pub use entity::{EntityClass, TtlPolicy};
pub use key_policy::{jittered, KeyPolicy};

/// Floor for any effective TTL.
pub const MIN_TTL: Duration = Duration::from_millis(1);
