//! In-memory blob store used as a test fake.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{validate_key, BlobStore};
use crate::error::{Result, StorageError};

/// In-memory `BlobStore`. Keys stay sorted, so `list` is a range scan.
#[derive(Default)]
pub struct MemBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        validate_key(key)?;
        let mut blobs = self.blobs.write().expect("blob map lock");
        blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let blobs = self.blobs.read().expect("blob map lock");
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let mut blobs = self.blobs.write().expect("blob map lock");
        blobs.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let blobs = self.blobs.read().expect("blob map lock");
        Ok(blobs.contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.read().expect("blob map lock");
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
