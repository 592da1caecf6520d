//! Hierarchical key → bytes blob storage.
//!
//! Keys are `/`-delimited UTF-8 paths (`stripes/users/<hash>`). Writes are
//! atomic per key; there is no cross-key atomicity. Higher layers (the
//! timeline) build their transaction discipline on top.

pub mod fs;
pub mod mem;

use crate::error::{Result, StorageError};

/// Path-keyed blob store interface.
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, atomically replacing any existing blob.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Retrieve the blob at `key`. Returns `StorageError::NotFound` if absent.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove the blob at `key`. No-op if absent.
    fn delete(&self, key: &str) -> Result<()>;

    /// Check whether `key` exists without reading the blob.
    fn exists(&self, key: &str) -> Result<bool>;

    /// List all keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Validate a blob key: non-empty `/`-delimited segments, no traversal.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_keys_pass() {
        validate_key("refs/HEAD").unwrap();
        validate_key("stripes/users/abc123").unwrap();
        validate_key("a").unwrap();
    }

    #[test]
    fn traversal_and_empty_segments_rejected() {
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("trailing/").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a/./b").is_err());
        assert!(validate_key("a\\b").is_err());
    }
}
