//! Membership-only bloom filters for footer statistics and bloom indexes.
//!
//! No false negatives. Size-capped: when the bit array saturates past the
//! fill ceiling the filter degrades to answering "present" for everything,
//! which keeps the no-false-negative contract and just loses pruning power.

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::datum::Datum;

const FILL_CEILING: f64 = 0.95;
const MIN_BITS: u64 = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomFilter {
    m_bits: u64,
    k: u16,
    saturated: bool,
    words: Vec<u64>,
}

impl BloomFilter {
    /// Build a filter sized for `expected_items` at `bits_per_item`, capped
    /// at `max_bits`.
    pub fn with_capacity(expected_items: usize, bits_per_item: usize, max_bits: usize) -> Self {
        let wanted = (expected_items.max(1) as u64) * bits_per_item.max(1) as u64;
        let m_bits = wanted.clamp(MIN_BITS, max_bits.max(MIN_BITS as usize) as u64);
        let words = vec![0u64; m_bits.div_ceil(64) as usize];
        Self { m_bits, k: 7, saturated: false, words }
    }

    fn positions(&self, datum: &Datum) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(canonical_bytes(datum));
        let h1 = u64::from_le_bytes(digest[0..8].try_into().expect("slice of 8"));
        let h2 = u64::from_le_bytes(digest[8..16].try_into().expect("slice of 8"));
        let m = self.m_bits;
        (0..self.k as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    pub fn insert(&mut self, datum: &Datum) {
        if self.saturated {
            return;
        }
        let positions: Vec<u64> = self.positions(datum).collect();
        for pos in positions {
            self.words[(pos / 64) as usize] |= 1u64 << (pos % 64);
        }
        if self.fill_ratio() > FILL_CEILING {
            self.saturated = true;
        }
    }

    /// Membership test. Never false-negative; `true` for everything once
    /// saturated.
    pub fn contains(&self, datum: &Datum) -> bool {
        if self.saturated {
            return true;
        }
        self.positions(datum)
            .all(|pos| self.words[(pos / 64) as usize] & (1u64 << (pos % 64)) != 0)
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated
    }

    pub fn fill_ratio(&self) -> f64 {
        let set: u64 = self.words.iter().map(|w| w.count_ones() as u64).sum();
        set as f64 / self.m_bits as f64
    }

    /// Compact binary form for stripe footers.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(11 + self.words.len() * 8);
        out.extend_from_slice(&self.m_bits.to_le_bytes());
        out.extend_from_slice(&self.k.to_le_bytes());
        out.push(self.saturated as u8);
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 11 {
            return None;
        }
        let m_bits = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let k = u16::from_le_bytes(bytes[8..10].try_into().ok()?);
        let saturated = bytes[10] != 0;
        let word_bytes = &bytes[11..];
        if word_bytes.len() % 8 != 0 || word_bytes.len() as u64 != m_bits.div_ceil(64) * 8 {
            return None;
        }
        let words = word_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("chunk of 8")))
            .collect();
        Some(Self { m_bits, k, saturated, words })
    }
}

/// Canonical bytes of a datum for hashing. Stable across processes.
pub fn canonical_bytes(datum: &Datum) -> Vec<u8> {
    let mut out = Vec::new();
    match datum {
        Datum::Null => out.push(0),
        Datum::Int(v) => {
            out.push(1);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Float(f) => {
            // Integral floats hash like the equal Int so equal datums agree.
            if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                out.push(1);
                out.extend_from_slice(&(*f as i64).to_le_bytes());
            } else {
                out.push(2);
                out.extend_from_slice(&f.to_bits().to_le_bytes());
            }
        }
        Datum::Bool(b) => {
            out.push(3);
            out.push(*b as u8);
        }
        Datum::Str(s) => {
            out.push(4);
            out.extend_from_slice(s.as_bytes());
        }
        Datum::Timestamp(t) => {
            out.push(5);
            out.extend_from_slice(&t.to_le_bytes());
        }
        Datum::Binary(b) => {
            out.push(6);
            out.extend_from_slice(b);
        }
    }
    out
}
