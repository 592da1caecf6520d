//! Durable catalog of databases, tables, columns, and secondary indexes.
//!
//! One `DatabaseSchema` per database root, persisted as JSON at
//! `schema/database.meta`. Column additions are append-only and bump the
//! minor version; structural changes bump the major version.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::blob::BlobStore;
use crate::datum::DataType;
use crate::error::{Result, StorageError};
use crate::hash::Hash256;

/// Blob key of the serialized schema.
pub const SCHEMA_KEY: &str = "schema/database.meta";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self { name: name.into(), data_type, nullable }
    }
}

/// Secondary index kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    BTree,
    Hash,
    Bitmap,
    Bloom,
}

impl IndexKind {
    pub fn name(&self) -> &'static str {
        match self {
            IndexKind::BTree => "btree",
            IndexKind::Hash => "hash",
            IndexKind::Bitmap => "bitmap",
            IndexKind::Bloom => "bloom",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "btree" => Some(IndexKind::BTree),
            "hash" => Some(IndexKind::Hash),
            "bitmap" => Some(IndexKind::Bitmap),
            "bloom" => Some(IndexKind::Bloom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub kind: IndexKind,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self { name: name.into(), columns, indexes: Vec::new() }
    }

    /// Position of a column in physical layout order.
    pub fn column_index(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| StorageError::UnknownColumn {
                table: self.name.clone(),
                column: column.to_string(),
            })
    }

    pub fn column(&self, column: &str) -> Result<&ColumnDef> {
        Ok(&self.columns[self.column_index(column)?])
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Fingerprint of the canonical column list, embedded in stripe footers.
    pub fn schema_fingerprint(&self) -> Hash256 {
        let canon: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{}:{}:{}", c.name, c.data_type, c.nullable))
            .collect();
        Hash256::compute(canon.join(";").as_bytes())
    }
}

/// View metadata. Data lives in a synthetic backing table committed through
/// the normal write path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDef {
    pub name: String,
    /// Normalized source query text.
    pub source_query: String,
    /// Name of the synthetic table holding the materialized rows.
    pub backing_table: String,
    pub dependency_tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub name: String,
    pub major_version: u32,
    pub minor_version: u32,
    pub tables: Vec<TableDef>,
    #[serde(default)]
    pub views: Vec<ViewDef>,
}

impl DatabaseSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            major_version: 1,
            minor_version: 0,
            tables: Vec::new(),
            views: Vec::new(),
        }
    }

    pub fn get_table(&self, name: &str) -> Result<&TableDef> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
    }

    fn get_table_mut(&mut self, name: &str) -> Result<&mut TableDef> {
        self.tables
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
    }
}

/// Registry persisting the schema through the blob store. Load-modify-save;
/// the engine keeps its own in-memory handle with swap-on-write discipline.
pub struct SchemaRegistry {
    store: Arc<dyn BlobStore>,
}

impl SchemaRegistry {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Load the current schema, or initialize an empty one named `name`.
    pub fn load_or_init(&self, name: &str) -> Result<DatabaseSchema> {
        match self.load() {
            Ok(schema) => Ok(schema),
            Err(StorageError::NotFound(_)) => {
                let schema = DatabaseSchema::new(name);
                self.save(&schema)?;
                Ok(schema)
            }
            Err(e) => Err(e),
        }
    }

    pub fn load(&self) -> Result<DatabaseSchema> {
        let bytes = self.store.get(SCHEMA_KEY)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, schema: &DatabaseSchema) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(schema)?;
        self.store.put(SCHEMA_KEY, &bytes)
    }

    pub fn create_table(&self, name: &str, columns: Vec<ColumnDef>) -> Result<DatabaseSchema> {
        let mut schema = self.load()?;
        if schema.tables.iter().any(|t| t.name == name) {
            return Err(StorageError::SchemaConflict(format!("table {name} already exists")));
        }
        let mut seen = std::collections::HashSet::new();
        for col in &columns {
            if !seen.insert(col.name.clone()) {
                return Err(StorageError::SchemaConflict(format!(
                    "duplicate column {} in table {name}",
                    col.name
                )));
            }
        }
        schema.tables.push(TableDef::new(name, columns));
        schema.major_version += 1;
        schema.minor_version = 0;
        self.save(&schema)?;
        info!(event = "schema.table_created", table = %name);
        Ok(schema)
    }

    pub fn drop_table(&self, name: &str) -> Result<DatabaseSchema> {
        let mut schema = self.load()?;
        let before = schema.tables.len();
        schema.tables.retain(|t| t.name != name);
        if schema.tables.len() == before {
            return Err(StorageError::UnknownTable(name.to_string()));
        }
        schema.major_version += 1;
        schema.minor_version = 0;
        self.save(&schema)?;
        info!(event = "schema.table_dropped", table = %name);
        Ok(schema)
    }

    /// Append-only column addition: a minor version bump.
    pub fn add_column(&self, table: &str, column: ColumnDef) -> Result<DatabaseSchema> {
        let mut schema = self.load()?;
        let t = schema.get_table_mut(table)?;
        if t.columns.iter().any(|c| c.name == column.name) {
            return Err(StorageError::SchemaConflict(format!(
                "column {} already exists in table {table}",
                column.name
            )));
        }
        if !column.nullable {
            return Err(StorageError::SchemaConflict(format!(
                "appended column {} must be nullable",
                column.name
            )));
        }
        t.columns.push(column);
        schema.minor_version += 1;
        self.save(&schema)?;
        Ok(schema)
    }

    /// Register an index. Column list must be a subset of the table's columns.
    pub fn add_index(&self, table: &str, index: IndexDef) -> Result<DatabaseSchema> {
        let mut schema = self.load()?;
        let t = schema.get_table_mut(table)?;
        if t.indexes.iter().any(|i| i.name == index.name) {
            return Err(StorageError::SchemaConflict(format!(
                "index {} already exists on table {table}",
                index.name
            )));
        }
        for col in &index.columns {
            if !t.columns.iter().any(|c| &c.name == col) {
                return Err(StorageError::UnknownColumn {
                    table: table.to_string(),
                    column: col.clone(),
                });
            }
        }
        t.indexes.push(index.clone());
        schema.minor_version += 1;
        self.save(&schema)?;
        info!(event = "schema.index_added", table = %table, index = %index.name, kind = %index.kind.name());
        Ok(schema)
    }

    pub fn drop_index(&self, table: &str, name: &str) -> Result<DatabaseSchema> {
        let mut schema = self.load()?;
        let t = schema.get_table_mut(table)?;
        let before = t.indexes.len();
        t.indexes.retain(|i| i.name != name);
        if t.indexes.len() == before {
            return Err(StorageError::UnknownIndex {
                table: table.to_string(),
                index: name.to_string(),
            });
        }
        schema.minor_version += 1;
        self.save(&schema)?;
        Ok(schema)
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.load()?.tables.into_iter().map(|t| t.name).collect())
    }
}
