//! Fingerprint-keyed result cache with table-dependency invalidation.
//!
//! An entry records, per dependency table, the stripe-set root it was
//! computed against. `get` revalidates those roots against the caller's
//! current resolution and self-evicts on any mismatch, so a hit is always
//! observationally equivalent to re-execution at HEAD. Eviction is LRU,
//! bounded by entry count and total byte size.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use varve_store::{Datum, Hash256, Row};

use crate::error::Result;
use crate::obs;

/// Cache key: canonicalized hash of the plan (normalized query text plus
/// chosen operator and degree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(Hash256);

impl Fingerprint {
    pub fn new(normalized_query: &str, operator: &str, degree: usize) -> Self {
        Fingerprint(Hash256::compute_parts(&[
            normalized_query.as_bytes(),
            b"\0",
            operator.as_bytes(),
            b"\0",
            &(degree as u64).to_le_bytes(),
        ]))
    }

    pub fn short(&self) -> String {
        self.0.short()
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub dep_tables: Vec<String>,
    /// Stripe-set root per dependency table at compute time.
    pub snapshot_roots: BTreeMap<String, Hash256>,
    pub bytes: usize,
}

fn datum_bytes(d: &Datum) -> usize {
    match d {
        Datum::Null | Datum::Bool(_) => 1,
        Datum::Int(_) | Datum::Float(_) | Datum::Timestamp(_) => 8,
        Datum::Str(s) => s.len() + 8,
        Datum::Binary(b) => b.len() + 8,
    }
}

/// Rough byte footprint of a result set.
pub fn estimate_result_bytes(rows: &[Row]) -> usize {
    rows.iter()
        .map(|r| 16 + r.iter().map(datum_bytes).sum::<usize>())
        .sum()
}

struct CacheInner {
    lru: LruCache<Fingerprint, Arc<CacheEntry>>,
    total_bytes: usize,
}

pub struct ResultCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
}

impl ResultCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(CacheInner { lru: LruCache::new(cap), total_bytes: 0 }),
            max_bytes,
        }
    }

    /// Look up a fingerprint. `current_root` resolves a table to its current
    /// stripe-set root; any divergence evicts the entry and reports a miss.
    pub fn get<F>(&self, fp: Fingerprint, current_root: F) -> Result<Option<Arc<CacheEntry>>>
    where
        F: Fn(&str) -> Result<Hash256>,
    {
        let entry = {
            let mut inner = self.inner.lock();
            inner.lru.get(&fp).cloned()
        };
        let Some(entry) = entry else {
            obs::emit_cache_miss(&fp.short());
            return Ok(None);
        };
        for table in &entry.dep_tables {
            let now = current_root(table)?;
            if entry.snapshot_roots.get(table) != Some(&now) {
                let mut inner = self.inner.lock();
                if let Some(stale) = inner.lru.pop(&fp) {
                    inner.total_bytes -= stale.bytes.min(inner.total_bytes);
                }
                obs::emit_cache_miss(&fp.short());
                return Ok(None);
            }
        }
        obs::emit_cache_hit(&fp.short());
        Ok(Some(entry))
    }

    pub fn put(&self, fp: Fingerprint, entry: CacheEntry) {
        if entry.bytes > self.max_bytes {
            return; // never admit an entry larger than the whole budget
        }
        let entry = Arc::new(entry);
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.push(fp, Arc::clone(&entry)) {
            // push returns the displaced pair (same key replaced, or LRU).
            inner.total_bytes -= old.1.bytes.min(inner.total_bytes);
        }
        inner.total_bytes += entry.bytes;
        while inner.total_bytes > self.max_bytes {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => {
                    inner.total_bytes -= evicted.bytes.min(inner.total_bytes)
                }
                None => break,
            }
        }
    }

    /// Remove every entry depending on `table`.
    pub fn invalidate(&self, table: &str) {
        let mut inner = self.inner.lock();
        let stale: Vec<Fingerprint> = inner
            .lru
            .iter()
            .filter(|(_, e)| e.dep_tables.iter().any(|t| t == table))
            .map(|(fp, _)| *fp)
            .collect();
        for fp in stale {
            if let Some(entry) = inner.lru.pop(&fp) {
                inner.total_bytes -= entry.bytes.min(inner.total_bytes);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        inner.total_bytes = 0;
    }
}
