//! Storage-level error taxonomy.

use thiserror::Error;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    #[error("corrupt stripe {stripe}: {detail}")]
    CorruptStripe { stripe: String, detail: String },

    #[error("corrupt blob {key}: {detail}")]
    CorruptBlob { key: String, detail: String },

    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("unknown index {index} on table {table}")]
    UnknownIndex { table: String, index: String },

    #[error("unique violation on index {index}: duplicate key {key}")]
    UniqueViolation { index: String, key: String },

    #[error("type mismatch for column {column}: expected {expected}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },

    #[error("stripe encode: {0}")]
    Encode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_context() {
        let err = StorageError::UnknownColumn {
            table: "users".to_string(),
            column: "nope".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("users"));
        assert!(msg.contains("nope"));
    }

    #[test]
    fn unique_violation_names_index_and_key() {
        let err = StorageError::UniqueViolation {
            index: "users_pk".to_string(),
            key: "[Int(7)]".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("users_pk"));
        assert!(msg.contains("Int(7)"));
    }
}
