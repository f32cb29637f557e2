// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bloom filter sizing, hashing and an in-process bitmap.
//!
//! Bit positions are derived from SHA-256 with double hashing, so every
//! process computes the same positions for the same element. That is what
//! lets several processes share one bitmap in Redis.

use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use super::FilterError;

/// Largest bitmap we create (Redis strings are capped at 512 MiB).
pub const MAX_BITS: u64 = 1 << 32;

/// Parameters of one bloom filter, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BloomParams {
    /// Bitmap size in bits (m)
    pub size_bits: u64,
    /// Hash functions per element (k)
    pub hashes: u32,
    /// Expected insertions the filter was sized for (n)
    pub expected: u64,
    /// Target false-positive probability (p)
    pub fpp: f64,
}

impl BloomParams {
    /// Optimal `m` and `k` for `n` insertions at false-positive rate `p`.
    ///
    /// `m = ceil(-n ln p / (ln 2)^2)`, `k = max(1, round(m / n * ln 2))`.
    pub fn optimal(expected: u64, fpp: f64) -> Result<Self, FilterError> {
        if expected == 0 {
            return Err(FilterError::InvalidParams("expected insertions must be > 0".into()));
        }
        if !(fpp > 0.0 && fpp < 1.0) {
            return Err(FilterError::InvalidParams(format!("fpp must be in (0, 1), got {}", fpp)));
        }

        let n = expected as f64;
        let ln2 = std::f64::consts::LN_2;
        let raw_bits = (-n * fpp.ln() / (ln2 * ln2)).ceil();
        let size_bits = (raw_bits as u64).clamp(1, MAX_BITS);
        let hashes = ((size_bits as f64 / n) * ln2).round().max(1.0) as u32;

        Ok(Self {
            size_bits,
            hashes,
            expected,
            fpp,
        })
    }

    /// Same sizing? (`expected` and `fpp` are informational.)
    #[must_use]
    pub fn same_shape(&self, other: &BloomParams) -> bool {
        self.size_bits == other.size_bits && self.hashes == other.hashes
    }

    /// Bit offsets for an element.
    #[must_use]
    pub fn positions(&self, element: &str) -> Vec<u64> {
        let digest = Sha256::digest(element.as_bytes());
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&digest[0..8]);
        second.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(first);
        // Odd step so consecutive positions never collapse onto one bit
        let h2 = u64::from_le_bytes(second) | 1;

        (0..u64::from(self.hashes))
            .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % self.size_bits)
            .collect()
    }

    /// Estimated element count from the number of set bits:
    /// `-(m / k) * ln(1 - X / m)`.
    #[must_use]
    pub fn estimate_count(&self, bits_set: u64) -> u64 {
        if bits_set == 0 {
            return 0;
        }
        let m = self.size_bits as f64;
        let k = f64::from(self.hashes);
        // A saturated bitmap would give ln(0)
        let x = bits_set.min(self.size_bits.saturating_sub(1)) as f64;
        (-(m / k) * (1.0 - x / m).ln()).round() as u64
    }
}

/// Lock-free in-process bitmap.
pub struct Bitmap {
    words: Vec<AtomicU64>,
    size_bits: u64,
}

impl Bitmap {
    #[must_use]
    pub fn new(size_bits: u64) -> Self {
        let words = size_bits.div_ceil(64) as usize;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            size_bits,
        }
    }

    #[must_use]
    pub fn size_bits(&self) -> u64 {
        self.size_bits
    }

    /// Set every offset; true if at least one bit flipped (element was new).
    pub fn set_all(&self, offsets: &[u64]) -> bool {
        let mut changed = false;
        for &offset in offsets {
            let (word, mask) = Self::locate(offset);
            let prev = self.words[word].fetch_or(mask, Ordering::AcqRel);
            changed |= prev & mask == 0;
        }
        changed
    }

    #[must_use]
    pub fn test_all(&self, offsets: &[u64]) -> bool {
        offsets.iter().all(|&offset| {
            let (word, mask) = Self::locate(offset);
            self.words[word].load(Ordering::Acquire) & mask != 0
        })
    }

    /// Population count.
    #[must_use]
    pub fn bits_set(&self) -> u64 {
        self.words
            .iter()
            .map(|w| u64::from(w.load(Ordering::Relaxed).count_ones()))
            .sum()
    }

    #[inline]
    fn locate(offset: u64) -> (usize, u64) {
        ((offset / 64) as usize, 1u64 << (offset % 64))
    }
}
