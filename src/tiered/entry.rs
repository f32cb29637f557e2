// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache entries: in-process slots and the distributed-tier wire envelope.
//!
//! On the wire a value is `{"kind":"value","data":<V>}` and the negative
//! sentinel is `{"kind":"absent"}`, so "confirmed absent" can never be
//! confused with a value that happens to serialize as `null`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// What a tier holds for a key.
#[derive(Debug)]
pub enum Cached<V> {
    Value(Arc<V>),
    /// Negative sentinel: confirmed absent from the system of record
    Absent,
}

impl<V> Clone for Cached<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(v) => Self::Value(Arc::clone(v)),
            Self::Absent => Self::Absent,
        }
    }
}

impl<V> Cached<V> {
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    #[must_use]
    pub fn value(&self) -> Option<&Arc<V>> {
        match self {
            Self::Value(v) => Some(v),
            Self::Absent => None,
        }
    }

    #[must_use]
    pub fn into_value(self) -> Option<Arc<V>> {
        match self {
            Self::Value(v) => Some(v),
            Self::Absent => None,
        }
    }
}

/// L1 value: the entry plus the TTL it was populated with.
pub(crate) struct L1Slot<V> {
    pub(crate) entry: Cached<V>,
    pub(crate) ttl: Duration,
}

impl<V> Clone for L1Slot<V> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            ttl: self.ttl,
        }
    }
}

/// Per-entry expiry: an L1 slot lives for the TTL it was written with.
/// The global L1 windows still apply on top.
pub(crate) struct SlotExpiry;

impl<V> Expiry<String, L1Slot<V>> for SlotExpiry {
    fn expire_after_create(&self, _key: &String, value: &L1Slot<V>, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &L1Slot<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
enum WireEntry<T> {
    Value(T),
    Absent,
}

pub(crate) fn encode<V: Serialize>(entry: &Cached<V>) -> Result<Vec<u8>, serde_json::Error> {
    match entry {
        Cached::Value(v) => serde_json::to_vec(&WireEntry::Value(v.as_ref())),
        Cached::Absent => serde_json::to_vec(&WireEntry::<&V>::Absent),
    }
}

pub(crate) fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<Cached<V>, serde_json::Error> {
    Ok(match serde_json::from_slice::<WireEntry<V>>(bytes)? {
        WireEntry::Value(v) => Cached::Value(Arc::new(v)),
        WireEntry::Absent => Cached::Absent,
    })
}
