//! Secondary indexes: btree, hash, bitmap, bloom.
//!
//! Every index maps key tuples to `(stripe_id, row_offset)` locators and is
//! derived state: it records the stripe-set hash it was built from, and a
//! reader must treat it as stale (and rebuild) once the table's stripe set
//! advances. Keys containing NULL are not indexed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blob::BlobStore;
use crate::datum::{Datum, Row};
use crate::error::{Result, StorageError};
use crate::hash::{Hash256, StripeId};
use crate::schema::{IndexDef, IndexKind, TableDef};
use crate::stripe::bloom::{canonical_bytes, BloomFilter};

/// Where one indexed row lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub stripe: StripeId,
    pub row: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexEntry {
    key: Vec<Datum>,
    locators: Vec<Locator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum IndexPayload {
    /// Sorted by key. Backs both btree (binary search) and hash (a lookup
    /// map is rebuilt on load).
    Entries(Vec<IndexEntry>),
    /// One bit-vector per distinct value per key column, over `positions`.
    Bitmap {
        positions: Vec<Locator>,
        columns: Vec<Vec<(Datum, Vec<u64>)>>,
    },
    /// Membership pre-filter over composite keys. No locators.
    Bloom { filter: BloomFilter, key_count: u64 },
}

/// A built secondary index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryIndex {
    pub table: String,
    pub def: IndexDef,
    /// Stripe-set hash this index was built from. Stale when it differs
    /// from the table's current set.
    pub built_from: Hash256,
    payload: IndexPayload,
    #[serde(skip)]
    eq_lookup: HashMap<Vec<Datum>, usize>,
}

fn key_as_datum(key: &[Datum]) -> Datum {
    let mut bytes = Vec::new();
    for d in key {
        let part = canonical_bytes(d);
        bytes.extend_from_slice(&(part.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&part);
    }
    Datum::Binary(bytes)
}

impl SecondaryIndex {
    /// Build an index over a table's stripes (each with decoded rows in
    /// stripe-local order). `built_from` is the stripe set's Merkle root.
    pub fn build(
        table: &TableDef,
        def: &IndexDef,
        stripes: &[(StripeId, Vec<Row>)],
        built_from: Hash256,
    ) -> Result<Self> {
        let positions: Vec<usize> = def
            .columns
            .iter()
            .map(|c| table.column_index(c))
            .collect::<Result<_>>()?;

        let mut keyed: BTreeMap<Vec<Datum>, Vec<Locator>> = BTreeMap::new();
        let mut all_locators = Vec::new();
        for (stripe_id, rows) in stripes {
            for (row_idx, row) in rows.iter().enumerate() {
                let locator = Locator { stripe: *stripe_id, row: row_idx as u32 };
                all_locators.push(locator);
                let key: Vec<Datum> = positions.iter().map(|&p| row[p].clone()).collect();
                if key.iter().any(Datum::is_null) {
                    continue;
                }
                let slot = keyed.entry(key.clone()).or_default();
                if def.unique && !slot.is_empty() {
                    return Err(StorageError::UniqueViolation {
                        index: def.name.clone(),
                        key: format!("{key:?}"),
                    });
                }
                slot.push(locator);
            }
        }

        let payload = match def.kind {
            IndexKind::BTree | IndexKind::Hash => IndexPayload::Entries(
                keyed
                    .into_iter()
                    .map(|(key, locators)| IndexEntry { key, locators })
                    .collect(),
            ),
            IndexKind::Bitmap => {
                let mut columns: Vec<BTreeMap<Datum, Vec<u64>>> =
                    vec![BTreeMap::new(); positions.len()];
                let words = all_locators.len().div_ceil(64);
                let mut bit = 0usize;
                for (_, rows) in stripes {
                    for row in rows {
                        for (ci, &p) in positions.iter().enumerate() {
                            let value = &row[p];
                            if !value.is_null() {
                                let bits = columns[ci]
                                    .entry(value.clone())
                                    .or_insert_with(|| vec![0u64; words]);
                                bits[bit / 64] |= 1u64 << (bit % 64);
                            }
                        }
                        bit += 1;
                    }
                }
                IndexPayload::Bitmap {
                    positions: all_locators,
                    columns: columns
                        .into_iter()
                        .map(|m| m.into_iter().collect())
                        .collect(),
                }
            }
            IndexKind::Bloom => {
                let keys: Vec<&Vec<Datum>> = keyed.keys().collect();
                let mut filter = BloomFilter::with_capacity(keys.len(), 10, 1 << 19);
                for key in &keys {
                    filter.insert(&key_as_datum(key));
                }
                IndexPayload::Bloom { filter, key_count: keys.len() as u64 }
            }
        };

        let mut index = Self {
            table: table.name.clone(),
            def: def.clone(),
            built_from,
            payload,
            eq_lookup: HashMap::new(),
        };
        index.rebuild_lookup();
        Ok(index)
    }

    fn rebuild_lookup(&mut self) {
        self.eq_lookup.clear();
        if self.def.kind == IndexKind::Hash {
            if let IndexPayload::Entries(entries) = &self.payload {
                for (i, e) in entries.iter().enumerate() {
                    self.eq_lookup.insert(e.key.clone(), i);
                }
            }
        }
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        match &self.payload {
            IndexPayload::Entries(entries) => entries.len(),
            IndexPayload::Bitmap { columns, .. } => {
                columns.first().map_or(0, |c| c.len())
            }
            IndexPayload::Bloom { key_count, .. } => *key_count as usize,
        }
    }

    /// Equality lookup on the full key tuple.
    pub fn lookup_eq(&self, key: &[Datum]) -> Vec<Locator> {
        match &self.payload {
            IndexPayload::Entries(entries) => match self.def.kind {
                IndexKind::Hash => self
                    .eq_lookup
                    .get(key)
                    .map(|&i| entries[i].locators.clone())
                    .unwrap_or_default(),
                _ => entries
                    .binary_search_by(|e| e.key.as_slice().cmp(key))
                    .map(|i| entries[i].locators.clone())
                    .unwrap_or_default(),
            },
            IndexPayload::Bitmap { .. } => {
                let eq: Vec<(usize, Datum)> =
                    key.iter().cloned().enumerate().collect();
                self.bitmap_intersect(&eq)
            }
            IndexPayload::Bloom { .. } => Vec::new(),
        }
    }

    /// Ordered range lookup (btree only; other kinds return everything
    /// matching via their own discipline or nothing).
    pub fn lookup_range(
        &self,
        lo: Option<&[Datum]>,
        hi: Option<&[Datum]>,
        lo_inclusive: bool,
        hi_inclusive: bool,
    ) -> Vec<Locator> {
        let IndexPayload::Entries(entries) = &self.payload else {
            return Vec::new();
        };
        let start = match lo {
            Some(lo) => entries.partition_point(|e| {
                let ord = e.key.as_slice().cmp(lo);
                ord == std::cmp::Ordering::Less
                    || (!lo_inclusive && ord == std::cmp::Ordering::Equal)
            }),
            None => 0,
        };
        let end = match hi {
            Some(hi) => entries.partition_point(|e| {
                let ord = e.key.as_slice().cmp(hi);
                ord == std::cmp::Ordering::Less
                    || (hi_inclusive && ord == std::cmp::Ordering::Equal)
            }),
            None => entries.len(),
        };
        entries[start..end.max(start)]
            .iter()
            .flat_map(|e| e.locators.iter().copied())
            .collect()
    }

    /// Prefix lookup on the leading key columns (btree only).
    pub fn lookup_prefix(&self, prefix: &[Datum]) -> Vec<Locator> {
        let IndexPayload::Entries(entries) = &self.payload else {
            return Vec::new();
        };
        let n = prefix.len();
        let start = entries.partition_point(|e| {
            e.key.get(..n.min(e.key.len())).map_or(true, |head| head < prefix)
        });
        entries[start..]
            .iter()
            .take_while(|e| e.key.get(..n.min(e.key.len())) == Some(prefix))
            .flat_map(|e| e.locators.iter().copied())
            .collect()
    }

    /// Bitmap intersection for per-column equality predicates. `eq` pairs a
    /// position within the index's column list with the wanted value.
    pub fn bitmap_intersect(&self, eq: &[(usize, Datum)]) -> Vec<Locator> {
        let IndexPayload::Bitmap { positions, columns } = &self.payload else {
            return Vec::new();
        };
        if eq.is_empty() {
            return Vec::new();
        }
        let words = positions.len().div_ceil(64);
        let mut acc = vec![u64::MAX; words];
        for (ci, value) in eq {
            let Some(per_value) = columns.get(*ci) else {
                return Vec::new();
            };
            match per_value.iter().find(|(v, _)| v == value) {
                Some((_, bits)) => {
                    for (a, b) in acc.iter_mut().zip(bits) {
                        *a &= *b;
                    }
                }
                None => return Vec::new(),
            }
        }
        let mut out = Vec::new();
        for (i, locator) in positions.iter().enumerate() {
            if acc[i / 64] & (1u64 << (i % 64)) != 0 {
                out.push(*locator);
            }
        }
        out
    }

    /// Membership pre-filter. `true` can be a false positive; `false` is a
    /// proof of absence.
    pub fn may_contain(&self, key: &[Datum]) -> bool {
        match &self.payload {
            IndexPayload::Bloom { filter, .. } => filter.contains(&key_as_datum(key)),
            IndexPayload::Entries(_) | IndexPayload::Bitmap { .. } => {
                !self.lookup_eq(key).is_empty()
            }
        }
    }
}

/// Blob key of an index.
pub fn index_key(table: &str, name: &str) -> String {
    format!("indexes/{table}/{name}")
}

/// Persists indexes as auxiliary blobs.
pub struct IndexStore {
    store: Arc<dyn BlobStore>,
}

impl IndexStore {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub fn save(&self, index: &SecondaryIndex) -> Result<()> {
        let bytes = serde_json::to_vec(index)?;
        self.store.put(&index_key(&index.table, &index.def.name), &bytes)?;
        debug!(
            event = "index.saved",
            table = %index.table,
            index = %index.def.name,
            keys = index.key_count(),
        );
        Ok(())
    }

    pub fn load(&self, table: &str, name: &str) -> Result<SecondaryIndex> {
        let bytes = self.store.get(&index_key(table, name))?;
        let mut index: SecondaryIndex = serde_json::from_slice(&bytes)?;
        index.rebuild_lookup();
        Ok(index)
    }

    pub fn delete(&self, table: &str, name: &str) -> Result<()> {
        self.store.delete(&index_key(table, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::mem::MemBlobStore;
    use crate::datum::DataType;
    use crate::schema::ColumnDef;

    fn table() -> TableDef {
        TableDef::new(
            "t",
            vec![
                ColumnDef::new("id", DataType::Int, false),
                ColumnDef::new("cat", DataType::Str, true),
            ],
        )
    }

    fn def(kind: IndexKind, unique: bool, columns: &[&str]) -> IndexDef {
        IndexDef {
            name: format!("t_{}", kind.name()),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            kind,
            unique,
        }
    }

    fn stripes() -> Vec<(StripeId, Vec<Row>)> {
        let s1 = Hash256::compute(b"s1");
        let s2 = Hash256::compute(b"s2");
        vec![
            (
                s1,
                vec![
                    vec![Datum::Int(1), Datum::Str("a".into())],
                    vec![Datum::Int(2), Datum::Str("b".into())],
                    vec![Datum::Int(3), Datum::Null],
                ],
            ),
            (
                s2,
                vec![
                    vec![Datum::Int(4), Datum::Str("a".into())],
                    vec![Datum::Int(5), Datum::Str("b".into())],
                ],
            ),
        ]
    }

    #[test]
    fn btree_eq_and_range() {
        let t = table();
        let idx = SecondaryIndex::build(
            &t,
            &def(IndexKind::BTree, true, &["id"]),
            &stripes(),
            Hash256::zero(),
        )
        .unwrap();

        let hits = idx.lookup_eq(&[Datum::Int(2)]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].row, 1);

        let range = idx.lookup_range(
            Some(&[Datum::Int(2)]),
            Some(&[Datum::Int(4)]),
            true,
            true,
        );
        assert_eq!(range.len(), 3);

        let open = idx.lookup_range(Some(&[Datum::Int(4)]), None, false, true);
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn hash_expected_constant_lookup() {
        let t = table();
        let idx = SecondaryIndex::build(
            &t,
            &def(IndexKind::Hash, false, &["cat"]),
            &stripes(),
            Hash256::zero(),
        )
        .unwrap();
        assert_eq!(idx.lookup_eq(&[Datum::Str("a".into())]).len(), 2);
        assert!(idx.lookup_eq(&[Datum::Str("zzz".into())]).is_empty());
    }

    #[test]
    fn unique_violation_detected() {
        let t = table();
        let err = SecondaryIndex::build(
            &t,
            &def(IndexKind::BTree, true, &["cat"]),
            &stripes(),
            Hash256::zero(),
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::UniqueViolation { .. }));
    }

    #[test]
    fn null_keys_not_indexed() {
        let t = table();
        let idx = SecondaryIndex::build(
            &t,
            &def(IndexKind::Hash, false, &["cat"]),
            &stripes(),
            Hash256::zero(),
        )
        .unwrap();
        // Two distinct non-null cats; the NULL row is absent.
        assert_eq!(idx.key_count(), 2);
    }

    #[test]
    fn bitmap_intersection() {
        let t = table();
        let idx = SecondaryIndex::build(
            &t,
            &def(IndexKind::Bitmap, false, &["id", "cat"]),
            &stripes(),
            Hash256::zero(),
        )
        .unwrap();
        let hits = idx.bitmap_intersect(&[(1, Datum::Str("b".into()))]);
        assert_eq!(hits.len(), 2);
        let narrowed =
            idx.bitmap_intersect(&[(0, Datum::Int(5)), (1, Datum::Str("b".into()))]);
        assert_eq!(narrowed.len(), 1);
        assert!(idx
            .bitmap_intersect(&[(0, Datum::Int(1)), (1, Datum::Str("b".into()))])
            .is_empty());
    }

    #[test]
    fn bloom_prefilter_no_false_negatives() {
        let t = table();
        let idx = SecondaryIndex::build(
            &t,
            &def(IndexKind::Bloom, false, &["id"]),
            &stripes(),
            Hash256::zero(),
        )
        .unwrap();
        for i in 1..=5 {
            assert!(idx.may_contain(&[Datum::Int(i)]));
        }
    }

    #[test]
    fn store_roundtrip_rebuilds_lookup() {
        let t = table();
        let built = SecondaryIndex::build(
            &t,
            &def(IndexKind::Hash, false, &["cat"]),
            &stripes(),
            Hash256::compute(b"set"),
        )
        .unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
        let index_store = IndexStore::new(store);
        index_store.save(&built).unwrap();
        let loaded = index_store.load("t", "t_hash").unwrap();
        assert_eq!(loaded.built_from, Hash256::compute(b"set"));
        assert_eq!(loaded.lookup_eq(&[Datum::Str("a".into())]).len(), 2);
        index_store.delete("t", "t_hash").unwrap();
        assert!(index_store.load("t", "t_hash").is_err());
    }
}
