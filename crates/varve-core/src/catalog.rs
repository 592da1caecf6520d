//! In-memory catalog handle over the durable schema registry.
//!
//! Readers clone an `Arc` snapshot of the schema; writers persist through
//! the registry and swap the whole snapshot behind the lock. Materialized
//! view definitions live in the schema and are mirrored as per-view meta
//! blobs at `views/<name>.meta`.

use std::sync::Arc;

use parking_lot::RwLock;

use varve_store::{
    BlobStore, ColumnDef, DatabaseSchema, IndexDef, SchemaRegistry, StorageError, ViewDef,
};

use crate::error::{EngineError, Result};

fn view_meta_key(name: &str) -> String {
    format!("views/{name}.meta")
}

pub struct Catalog {
    registry: SchemaRegistry,
    store: Arc<dyn BlobStore>,
    current: RwLock<Arc<DatabaseSchema>>,
}

impl Catalog {
    pub fn open(store: Arc<dyn BlobStore>, database_name: &str) -> Result<Self> {
        let registry = SchemaRegistry::new(Arc::clone(&store));
        let schema = registry.load_or_init(database_name)?;
        Ok(Self { registry, store, current: RwLock::new(Arc::new(schema)) })
    }

    /// Cheap read handle; stays coherent for the reader's lifetime.
    pub fn schema(&self) -> Arc<DatabaseSchema> {
        Arc::clone(&self.current.read())
    }

    fn swap(&self, schema: DatabaseSchema) {
        *self.current.write() = Arc::new(schema);
    }

    pub fn create_table(&self, name: &str, columns: Vec<ColumnDef>) -> Result<()> {
        let schema = self.registry.create_table(name, columns)?;
        self.swap(schema);
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let schema = self.registry.drop_table(name)?;
        self.swap(schema);
        Ok(())
    }

    pub fn add_column(&self, table: &str, column: ColumnDef) -> Result<()> {
        let schema = self.registry.add_column(table, column)?;
        self.swap(schema);
        Ok(())
    }

    pub fn add_index(&self, table: &str, index: IndexDef) -> Result<()> {
        let schema = self.registry.add_index(table, index)?;
        self.swap(schema);
        Ok(())
    }

    pub fn drop_index(&self, table: &str, name: &str) -> Result<()> {
        let schema = self.registry.drop_index(table, name)?;
        self.swap(schema);
        Ok(())
    }

    /// Locate the table owning an index by the index name alone.
    pub fn table_of_index(&self, index_name: &str) -> Result<String> {
        let schema = self.schema();
        for table in &schema.tables {
            if table.indexes.iter().any(|i| i.name == index_name) {
                return Ok(table.name.clone());
            }
        }
        Err(EngineError::Catalog(format!("unknown index {index_name}")))
    }

    // -----------------------------------------------------------------------
    // Materialized views
    // -----------------------------------------------------------------------

    pub fn register_view(&self, view: ViewDef) -> Result<()> {
        let mut schema = self.registry.load()?;
        if schema.views.iter().any(|v| v.name == view.name) {
            return Err(StorageError::SchemaConflict(format!(
                "view {} already exists",
                view.name
            ))
            .into());
        }
        let meta = serde_json::to_vec_pretty(&view)
            .map_err(|e| EngineError::Internal(format!("view meta encode: {e}")))?;
        self.store.put(&view_meta_key(&view.name), &meta)?;
        schema.views.push(view);
        schema.minor_version += 1;
        self.registry.save(&schema)?;
        self.swap(schema);
        Ok(())
    }

    pub fn drop_view(&self, name: &str) -> Result<()> {
        let mut schema = self.registry.load()?;
        let before = schema.views.len();
        schema.views.retain(|v| v.name != name);
        if schema.views.len() == before {
            return Err(EngineError::Catalog(format!("unknown view {name}")));
        }
        self.store.delete(&view_meta_key(name))?;
        schema.minor_version += 1;
        self.registry.save(&schema)?;
        self.swap(schema);
        Ok(())
    }

    pub fn get_view(&self, name: &str) -> Option<ViewDef> {
        self.schema().views.iter().find(|v| v.name == name).cloned()
    }

    /// Materialized-view substitution: a view whose normalized source query
    /// equals the input query.
    pub fn find_view_by_query(&self, normalized: &str) -> Option<ViewDef> {
        self.schema().views.iter().find(|v| v.source_query == normalized).cloned()
    }

    /// Views that must refresh when `table` advances.
    pub fn views_depending_on(&self, table: &str) -> Vec<ViewDef> {
        self.schema()
            .views
            .iter()
            .filter(|v| v.dependency_tables.iter().any(|t| t == table))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use varve_store::{DataType, MemBlobStore};

    use super::*;

    fn catalog() -> Catalog {
        let store: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
        Catalog::open(store, "testdb").unwrap()
    }

    fn cols() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", DataType::Int, false),
            ColumnDef::new("v", DataType::Int, true),
        ]
    }

    #[test]
    fn snapshot_handles_stay_coherent_across_writes() {
        let cat = catalog();
        let before = cat.schema();
        cat.create_table("t", cols()).unwrap();
        // The old handle still sees the old world; new reads see the table.
        assert!(before.get_table("t").is_err());
        assert!(cat.schema().get_table("t").is_ok());
    }

    #[test]
    fn view_registration_and_lookup() {
        let cat = catalog();
        cat.create_table("t", cols()).unwrap();
        let view = ViewDef {
            name: "mv".into(),
            source_query: "SELECT id, v FROM t WHERE (v >= 20)".into(),
            backing_table: "__view__mv".into(),
            dependency_tables: vec!["t".into()],
        };
        cat.register_view(view.clone()).unwrap();

        assert_eq!(cat.get_view("mv").unwrap(), view);
        assert_eq!(
            cat.find_view_by_query("SELECT id, v FROM t WHERE (v >= 20)").unwrap().name,
            "mv"
        );
        assert!(cat.find_view_by_query("SELECT * FROM t").is_none());
        assert_eq!(cat.views_depending_on("t").len(), 1);
        assert!(cat.views_depending_on("other").is_empty());

        assert!(cat.register_view(view).is_err());
        cat.drop_view("mv").unwrap();
        assert!(cat.get_view("mv").is_none());
        assert!(cat.drop_view("mv").is_err());
    }

    #[test]
    fn index_owner_lookup() {
        let cat = catalog();
        cat.create_table("t", cols()).unwrap();
        cat.add_index(
            "t",
            IndexDef {
                name: "t_id".into(),
                columns: vec!["id".into()],
                kind: varve_store::IndexKind::BTree,
                unique: true,
            },
        )
        .unwrap();
        assert_eq!(cat.table_of_index("t_id").unwrap(), "t");
        assert!(cat.table_of_index("ghost").is_err());
    }
}
