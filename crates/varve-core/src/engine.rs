//! The engine: one database root tying together the blob store, catalog,
//! timeline, result cache, and index store.
//!
//! Writes follow the commit state machine: stripes and manifests are staged
//! first, the commit record is written, and HEAD advances last. Aborted
//! writes leave at most unreferenced draft blobs behind, which the next `gc`
//! sweep removes.

use std::sync::Arc;

use tracing::info;

use varve_store::{
    encode_stripe, parse_stripe, read_stripe_footer, stripe_key, BlobStore, ColumnDef, Datum,
    FsBlobStore, Hash256, IndexStore, MemBlobStore, PrunePredicate, Row, SecondaryIndex,
    StripeId, StripeOptions, StripeSet, TableDef,
};

use crate::cache::ResultCache;
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::exec::{eval_row_expr, row_matches};
use crate::lang::ast::Expr;
use crate::plan::{IndexMeta, TableStats};
use crate::timeline::{verify, Quarantine, TableRef, Timeline, VerifyReport};

pub struct Engine {
    pub store: Arc<dyn BlobStore>,
    pub catalog: Catalog,
    pub timeline: Timeline,
    pub cache: ResultCache,
    pub index_store: IndexStore,
    pub quarantine: Quarantine,
    pub config: EngineConfig,
}

/// Outcome of a write-path statement.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub rows_affected: u64,
    pub commit: Option<varve_store::CommitId>,
}

impl Engine {
    pub fn open(root: impl AsRef<std::path::Path>, config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(root)?);
        Self::with_store(store, config)
    }

    /// In-memory engine, used by tests and ephemeral sessions.
    pub fn ephemeral(config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
        Self::with_store(store, config)
    }

    pub fn with_store(store: Arc<dyn BlobStore>, config: EngineConfig) -> Result<Self> {
        let catalog = Catalog::open(Arc::clone(&store), "varve")?;
        let timeline =
            Timeline::open(Arc::clone(&store), config.append_retries, config.append_backoff_ms);
        let cache = ResultCache::new(config.cache_max_entries, config.cache_max_bytes);
        let index_store = IndexStore::new(Arc::clone(&store));
        Ok(Self {
            store,
            catalog,
            timeline,
            cache,
            index_store,
            quarantine: Quarantine::new(),
            config,
        })
    }

    fn stripe_options(&self, table: &TableDef) -> StripeOptions {
        // Footer blooms go on every indexed leading column.
        let bloom_columns = table
            .indexes
            .iter()
            .filter_map(|i| i.columns.first())
            .filter_map(|c| table.column_index(c).ok())
            .collect();
        StripeOptions {
            page_target_bytes: self.config.page_bytes,
            bloom_columns,
            bloom_bits_per_value: self.config.bloom_bits_per_value,
            bloom_max_bits: self.config.bloom_max_bits,
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The stripe-set root of `table` at HEAD (zero before any commit).
    pub fn current_root(&self, table: &str) -> Result<Hash256> {
        match self.timeline.head()? {
            Some(head) => self.timeline.table_root_at(head, table),
            None => Ok(Hash256::zero()),
        }
    }

    /// The stripe set of `table` bound to `commit` (HEAD when `None`).
    pub fn table_set(&self, table: &str, commit: Option<Hash256>) -> Result<StripeSet> {
        let at = match commit {
            Some(c) => c,
            None => match self.timeline.head()? {
                Some(head) => head,
                None => return Ok(StripeSet::default()),
            },
        };
        self.timeline.table_state_at(at, table)
    }

    /// Footer-level statistics for planning.
    pub fn table_stats(
        &self,
        table: &str,
        set: &StripeSet,
        predicates: &[PrunePredicate],
    ) -> Result<TableStats> {
        let mut stats = TableStats { row_count: 0, stripe_count: 0, surviving_stripes: 0 };
        for stripe in &set.stripes {
            let key = stripe_key(table, stripe);
            if self.quarantine.is_marked(&key) {
                return Err(EngineError::Integrity(format!(
                    "stripe {} is quarantined pending repair",
                    stripe.short()
                )));
            }
            let footer = read_stripe_footer(&self.store.get(&key)?, Some(stripe))?;
            stats.stripe_count += 1;
            stats.row_count += footer.row_count();
            if predicates.iter().all(|p| footer.may_match(p)) {
                stats.surviving_stripes += 1;
            }
        }
        Ok(stats)
    }

    /// Index metadata for the planner; staleness is judged against the
    /// bound stripe set's root.
    pub fn index_metas(&self, table: &TableDef, set_root: Hash256) -> Vec<IndexMeta> {
        let mut out = Vec::new();
        for def in &table.indexes {
            let loaded = self.index_store.load(&table.name, &def.name);
            let (key_count, stale) = match &loaded {
                Ok(index) => (index.key_count(), index.built_from != set_root),
                Err(_) => (0, true),
            };
            out.push(IndexMeta {
                name: def.name.clone(),
                kind: def.kind,
                columns: def.columns.clone(),
                unique: def.unique,
                key_count,
                stale,
            });
        }
        out
    }

    /// Decode every stripe of a set (index rebuilds, copy-on-write).
    pub fn read_table_rows(
        &self,
        table: &TableDef,
        set: &StripeSet,
    ) -> Result<Vec<(StripeId, Vec<Row>)>> {
        let mut out = Vec::with_capacity(set.stripes.len());
        for stripe in &set.stripes {
            let key = stripe_key(&table.name, stripe);
            if self.quarantine.is_marked(&key) {
                return Err(EngineError::Integrity(format!(
                    "stripe {} is quarantined pending repair",
                    stripe.short()
                )));
            }
            let parsed = parse_stripe(&self.store.get(&key)?, Some(stripe))?;
            out.push((*stripe, parsed.decode_rows(None)?));
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Coerce one incoming row against the table definition, enforcing
    /// nullability.
    fn coerce_row(&self, table: &TableDef, row: Vec<Datum>) -> Result<Row> {
        let mut out = Vec::with_capacity(table.columns.len());
        for (datum, col) in row.into_iter().zip(&table.columns) {
            if datum.is_null() && !col.nullable {
                return Err(EngineError::Constraint(format!(
                    "column {} is not nullable",
                    col.name
                )));
            }
            out.push(datum.coerce(col.data_type, &col.name)?);
        }
        Ok(out)
    }

    /// INSERT: append-only new stripes; existing stripes are untouched.
    pub fn insert_rows(
        &self,
        table_name: &str,
        columns: Option<&[String]>,
        incoming: Vec<Vec<Datum>>,
    ) -> Result<WriteOutcome> {
        let schema = self.catalog.schema();
        let table = schema.get_table(table_name)?;

        // Map the provided column list onto layout order, NULL elsewhere.
        let positions: Vec<usize> = match columns {
            Some(cols) => cols.iter().map(|c| table.column_index(c)).collect::<varve_store::Result<_>>()?,
            None => (0..table.columns.len()).collect(),
        };
        let mut rows = Vec::with_capacity(incoming.len());
        for values in incoming {
            if values.len() != positions.len() {
                return Err(EngineError::Constraint(format!(
                    "expected {} value(s) per row, got {}",
                    positions.len(),
                    values.len()
                )));
            }
            let mut row = vec![Datum::Null; table.columns.len()];
            for (value, &pos) in values.into_iter().zip(&positions) {
                row[pos] = value;
            }
            rows.push(self.coerce_row(table, row)?);
        }
        let affected = rows.len() as u64;

        let current = self.table_set(table_name, None)?;
        let mut new_set = current.clone();
        let mut staged: Vec<varve_store::EncodedStripe> = Vec::new();
        for chunk in rows.chunks(self.config.stripe_rows.max(1)) {
            let encoded = encode_stripe(table, chunk, &self.stripe_options(table))?;
            new_set.stripes.push(encoded.id);
            staged.push(encoded);
        }

        let commit = self.commit_table_state(table, &current, new_set, staged, "insert")?;
        Ok(WriteOutcome { rows_affected: affected, commit: Some(commit) })
    }

    /// UPDATE: copy-on-write; only stripes containing affected rows are
    /// rewritten, the rest stay referenced by hash.
    pub fn update_rows(
        &self,
        table_name: &str,
        assignments: &[(String, Expr)],
        where_clause: Option<&Expr>,
        strict: bool,
    ) -> Result<WriteOutcome> {
        let schema = self.catalog.schema();
        let table = schema.get_table(table_name)?;
        let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        for (col, _) in assignments {
            table.column_index(col)?;
        }

        self.rewrite_stripes(table, "update", |row| {
            let matches = match where_clause {
                Some(pred) => row_matches(pred, &columns, row, strict)?,
                None => true,
            };
            if !matches {
                return Ok(RowEdit::Keep);
            }
            let mut updated = row.clone();
            for (col, expr) in assignments {
                let pos = table.column_index(col)?;
                let value = eval_row_expr(expr, &columns, row, strict)?;
                if value.is_null() && !table.columns[pos].nullable {
                    return Err(EngineError::Constraint(format!(
                        "column {col} is not nullable"
                    )));
                }
                updated[pos] = value.coerce(table.columns[pos].data_type, col)?;
            }
            Ok(RowEdit::Replace(updated))
        })
    }

    /// DELETE: copy-on-write; stripes losing all rows are dropped from the
    /// set entirely.
    pub fn delete_rows(
        &self,
        table_name: &str,
        where_clause: Option<&Expr>,
        strict: bool,
    ) -> Result<WriteOutcome> {
        let schema = self.catalog.schema();
        let table = schema.get_table(table_name)?;
        let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();

        self.rewrite_stripes(table, "delete", |row| {
            let matches = match where_clause {
                Some(pred) => row_matches(pred, &columns, row, strict)?,
                None => true,
            };
            Ok(if matches { RowEdit::Remove } else { RowEdit::Keep })
        })
    }

    fn rewrite_stripes(
        &self,
        table: &TableDef,
        operation: &str,
        mut edit: impl FnMut(&Row) -> Result<RowEdit>,
    ) -> Result<WriteOutcome> {
        let current = self.table_set(&table.name, None)?;
        let mut new_set = StripeSet::default();
        let mut staged = Vec::new();
        let mut affected = 0u64;

        for stripe in &current.stripes {
            let key = stripe_key(&table.name, stripe);
            if self.quarantine.is_marked(&key) {
                return Err(EngineError::Integrity(format!(
                    "stripe {} is quarantined pending repair",
                    stripe.short()
                )));
            }
            let parsed = parse_stripe(&self.store.get(&key)?, Some(stripe))?;
            let rows = parsed.decode_rows(None)?;
            let mut rewritten = Vec::with_capacity(rows.len());
            let mut touched = false;
            for row in rows {
                match edit(&row)? {
                    RowEdit::Keep => rewritten.push(row),
                    RowEdit::Replace(updated) => {
                        touched = true;
                        affected += 1;
                        rewritten.push(updated);
                    }
                    RowEdit::Remove => {
                        touched = true;
                        affected += 1;
                    }
                }
            }
            if !touched {
                // Unaffected stripe: keep the reference, no rewrite.
                new_set.stripes.push(*stripe);
            } else if !rewritten.is_empty() {
                let encoded = encode_stripe(table, &rewritten, &self.stripe_options(table))?;
                new_set.stripes.push(encoded.id);
                staged.push(encoded);
            }
        }

        if affected == 0 {
            return Ok(WriteOutcome { rows_affected: 0, commit: None });
        }
        let commit = self.commit_table_state(table, &current, new_set, staged, operation)?;
        Ok(WriteOutcome { rows_affected: affected, commit: Some(commit) })
    }

    /// Stage stripes, rebuild indexes (unique checks happen here, before
    /// anything is committed), write the manifest, append the commit, then
    /// persist indexes and invalidate dependent cache entries.
    fn commit_table_state(
        &self,
        table: &TableDef,
        old_set: &StripeSet,
        new_set: StripeSet,
        staged: Vec<varve_store::EncodedStripe>,
        operation: &str,
    ) -> Result<varve_store::CommitId> {
        let new_root = new_set.merkle_root();

        // Rebuild indexes in memory against the candidate state first: a
        // UniqueViolation must abort with nothing staged.
        let mut all_rows: Vec<(StripeId, Vec<Row>)> = Vec::with_capacity(new_set.stripes.len());
        let staged_ids: Vec<StripeId> = staged.iter().map(|s| s.id).collect();
        for stripe in &new_set.stripes {
            if let Some(pos) = staged_ids.iter().position(|id| id == stripe) {
                let parsed = parse_stripe(&staged[pos].bytes, Some(stripe))?;
                all_rows.push((*stripe, parsed.decode_rows(None)?));
            } else if old_set.stripes.contains(stripe) {
                let parsed =
                    parse_stripe(&self.store.get(&stripe_key(&table.name, stripe))?, Some(stripe))?;
                all_rows.push((*stripe, parsed.decode_rows(None)?));
            }
        }
        let mut rebuilt = Vec::with_capacity(table.indexes.len());
        for def in &table.indexes {
            rebuilt.push(SecondaryIndex::build(table, def, &all_rows, new_root)?);
        }

        // Stage stripes and the manifest.
        for encoded in &staged {
            self.store.put(&stripe_key(&table.name, &encoded.id), &encoded.bytes)?;
        }
        self.timeline.put_manifest(&table.name, &new_set)?;

        // Append: HEAD advances, the change becomes visible.
        let operation_text = format!("{operation} {}", table.name);
        let commit = self.timeline.append(
            &self.config.author,
            &operation_text,
            vec![TableRef { table: table.name.clone(), stripe_set_hash: new_root }],
        )?;

        for index in &rebuilt {
            self.index_store.save(index)?;
        }
        self.cache.invalidate(&table.name);
        info!(
            event = "write.committed",
            table = %table.name,
            operation = %operation,
            commit = %commit.short(),
            stripes = new_set.stripes.len(),
        );
        Ok(commit)
    }

    /// Append a commit that only records a DDL operation.
    pub fn commit_ddl(&self, operation: &str, table_refs: Vec<TableRef>) -> Result<varve_store::CommitId> {
        self.timeline.append(&self.config.author, operation, table_refs)
    }

    /// Replace a table's contents wholesale (materialized-view refresh).
    /// Content addressing makes this idempotent: an identical result set
    /// produces the same stripe-set root and no commit is appended.
    /// Returns whether the table advanced.
    pub fn replace_table_rows(&self, table_name: &str, rows: Vec<Row>) -> Result<bool> {
        let schema = self.catalog.schema();
        let table = schema.get_table(table_name)?;
        let coerced: Vec<Row> = rows
            .into_iter()
            .map(|row| self.coerce_row(table, row))
            .collect::<Result<_>>()?;

        let current = self.table_set(table_name, None)?;
        let mut new_set = StripeSet::default();
        let mut staged = Vec::new();
        for chunk in coerced.chunks(self.config.stripe_rows.max(1)) {
            let encoded = encode_stripe(table, chunk, &self.stripe_options(table))?;
            new_set.stripes.push(encoded.id);
            staged.push(encoded);
        }
        if new_set.merkle_root() == current.merkle_root() {
            return Ok(false);
        }
        self.commit_table_state(table, &current, new_set, staged, "refresh")?;
        Ok(true)
    }

    /// Rebuild one index against the current stripe set.
    pub fn rebuild_index(&self, table_name: &str, index_name: &str) -> Result<()> {
        let schema = self.catalog.schema();
        let table = schema.get_table(table_name)?;
        let def = table
            .index(index_name)
            .ok_or_else(|| EngineError::Catalog(format!("unknown index {index_name}")))?
            .clone();
        let set = self.table_set(table_name, None)?;
        let rows = self.read_table_rows(table, &set)?;
        let index = SecondaryIndex::build(table, &def, &rows, set.merkle_root())?;
        self.index_store.save(&index)
            .map_err(EngineError::from)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    pub fn verify(&self) -> Result<VerifyReport> {
        verify::verify(&self.timeline, &self.quarantine)
    }

    pub fn gc(&self) -> Result<crate::timeline::GcReport> {
        self.timeline.gc()
    }

    /// Create table plus the presence-recording commit.
    pub fn create_table(&self, name: &str, columns: Vec<ColumnDef>) -> Result<varve_store::CommitId> {
        self.catalog.create_table(name, columns)?;
        let root = StripeSet::default().merkle_root();
        self.commit_ddl(
            &format!("create table {name}"),
            vec![TableRef { table: name.to_string(), stripe_set_hash: root }],
        )
    }
}

enum RowEdit {
    Keep,
    Replace(Row),
    Remove,
}

#[cfg(test)]
mod tests {
    use varve_store::DataType;

    use super::*;
    use crate::lang::ast::Statement;
    use crate::lang::parser::parse_statement;

    fn expr_of(src: &str) -> Expr {
        let Statement::Expr(e) = parse_statement(src).unwrap() else { panic!() };
        e
    }

    fn engine_with_table() -> Engine {
        let engine = Engine::ephemeral(EngineConfig::default()).unwrap();
        engine
            .create_table(
                "t",
                vec![
                    ColumnDef::new("id", DataType::Int, false),
                    ColumnDef::new("v", DataType::Int, true),
                ],
            )
            .unwrap();
        engine
    }

    fn insert_123(engine: &Engine) -> WriteOutcome {
        engine
            .insert_rows(
                "t",
                None,
                vec![
                    vec![Datum::Int(1), Datum::Int(10)],
                    vec![Datum::Int(2), Datum::Int(20)],
                    vec![Datum::Int(3), Datum::Int(30)],
                ],
            )
            .unwrap()
    }

    #[test]
    fn insert_appends_stripes_and_commits() {
        let engine = engine_with_table();
        let outcome = insert_123(&engine);
        assert_eq!(outcome.rows_affected, 3);
        let set = engine.table_set("t", None).unwrap();
        assert_eq!(set.stripes.len(), 1);

        let stats = engine.table_stats("t", &set, &[]).unwrap();
        assert_eq!(stats.row_count, 3);
    }

    #[test]
    fn insert_with_column_subset_fills_null() {
        let engine = engine_with_table();
        engine
            .insert_rows("t", Some(&["id".to_string()]), vec![vec![Datum::Int(9)]])
            .unwrap();
        let set = engine.table_set("t", None).unwrap();
        let rows = engine
            .read_table_rows(engine.catalog.schema().get_table("t").unwrap(), &set)
            .unwrap();
        assert_eq!(rows[0].1[0], vec![Datum::Int(9), Datum::Null]);
    }

    #[test]
    fn non_nullable_violation_rejected() {
        let engine = engine_with_table();
        let err = engine
            .insert_rows("t", None, vec![vec![Datum::Null, Datum::Int(1)]])
            .unwrap_err();
        assert!(matches!(err, EngineError::Constraint(_)));
    }

    #[test]
    fn update_is_copy_on_write() {
        let engine = engine_with_table();
        insert_123(&engine);
        // Second stripe that the update will not touch.
        engine
            .insert_rows("t", None, vec![vec![Datum::Int(50), Datum::Int(500)]])
            .unwrap();
        let before = engine.table_set("t", None).unwrap();

        let outcome = engine
            .update_rows("t", &[("v".to_string(), expr_of("99"))], Some(&expr_of("id == 1")), false)
            .unwrap();
        assert_eq!(outcome.rows_affected, 1);

        let after = engine.table_set("t", None).unwrap();
        assert_eq!(after.stripes.len(), 2);
        // Untouched stripe is shared by hash; the touched one was rewritten.
        assert_ne!(after.stripes[0], before.stripes[0]);
        assert_eq!(after.stripes[1], before.stripes[1]);
    }

    #[test]
    fn delete_drops_emptied_stripes() {
        let engine = engine_with_table();
        insert_123(&engine);
        let outcome = engine.delete_rows("t", None, false).unwrap();
        assert_eq!(outcome.rows_affected, 3);
        let set = engine.table_set("t", None).unwrap();
        assert!(set.stripes.is_empty());
    }

    #[test]
    fn noop_write_appends_no_commit() {
        let engine = engine_with_table();
        insert_123(&engine);
        let head_before = engine.timeline.head().unwrap();
        let outcome = engine
            .delete_rows("t", Some(&expr_of("id == 12345")), false)
            .unwrap();
        assert_eq!(outcome.rows_affected, 0);
        assert!(outcome.commit.is_none());
        assert_eq!(engine.timeline.head().unwrap(), head_before);
    }

    #[test]
    fn unique_index_blocks_duplicate_insert() {
        let engine = engine_with_table();
        engine
            .catalog
            .add_index(
                "t",
                varve_store::IndexDef {
                    name: "t_id".into(),
                    columns: vec!["id".into()],
                    kind: varve_store::IndexKind::BTree,
                    unique: true,
                },
            )
            .unwrap();
        insert_123(&engine);
        let head_before = engine.timeline.head().unwrap();

        let err = engine
            .insert_rows("t", None, vec![vec![Datum::Int(2), Datum::Int(99)]])
            .unwrap_err();
        assert!(matches!(err, EngineError::Constraint(_)));
        // The failed write left HEAD untouched.
        assert_eq!(engine.timeline.head().unwrap(), head_before);
    }

    #[test]
    fn index_staleness_tracks_set_root() {
        let engine = engine_with_table();
        engine
            .catalog
            .add_index(
                "t",
                varve_store::IndexDef {
                    name: "t_id".into(),
                    columns: vec!["id".into()],
                    kind: varve_store::IndexKind::BTree,
                    unique: false,
                },
            )
            .unwrap();
        insert_123(&engine);

        let schema = engine.catalog.schema();
        let table = schema.get_table("t").unwrap();
        let set = engine.table_set("t", None).unwrap();
        let metas = engine.index_metas(table, set.merkle_root());
        assert_eq!(metas.len(), 1);
        // The write path rebuilt the index against the new set.
        assert!(!metas[0].stale);

        // Against some other root the same index reads as stale.
        let metas = engine.index_metas(table, Hash256::compute(b"other"));
        assert!(metas[0].stale);
    }

    #[test]
    fn write_invalidates_cache() {
        let engine = engine_with_table();
        insert_123(&engine);
        let fp = crate::cache::Fingerprint::new("SELECT * FROM t", "seq_scan", 1);
        let root = engine.current_root("t").unwrap();
        engine.cache.put(
            fp,
            crate::cache::CacheEntry {
                columns: vec!["id".into()],
                rows: vec![],
                dep_tables: vec!["t".into()],
                snapshot_roots: std::collections::BTreeMap::from([("t".to_string(), root)]),
                bytes: 10,
            },
        );
        assert_eq!(engine.cache.len(), 1);
        engine
            .insert_rows("t", None, vec![vec![Datum::Int(4), Datum::Int(40)]])
            .unwrap();
        assert_eq!(engine.cache.len(), 0);
    }
}
