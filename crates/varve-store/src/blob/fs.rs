//! Filesystem-backed blob store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{validate_key, BlobStore};
use crate::error::{Result, StorageError};

/// Blob store over a root directory. Directories are implicit: `put` creates
/// parents as needed, and keys map one-to-one onto relative file paths.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`. Creates the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        path
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        validate_key(key)?;
        let path = self.key_path(key);
        let parent = path.parent().ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent)?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let path = self.key_path(key);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let path = self.key_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.key_path(key).exists())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir_part = prefix.rfind('/').map_or("", |idx| &prefix[..idx]);
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.key_path(dir_part)
        };
        if !start.is_dir() {
            return Ok(Vec::new());
        }
        let base = if dir_part.is_empty() {
            String::new()
        } else {
            format!("{dir_part}/")
        };
        let mut keys = Vec::new();
        collect_keys(&start, &base, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

fn collect_keys(dir: &Path, base: &str, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // In-flight temp files from atomic writes are not blobs.
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            collect_keys(&path, &format!("{base}{name}/"), out)?;
        } else {
            out.push(format!("{base}{name}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn blob_roundtrip() {
        let (_dir, store) = make_store();
        store.put("refs/HEAD", b"hello world").unwrap();
        let got = store.get("refs/HEAD").unwrap();
        assert_eq!(got, b"hello world");
    }

    #[test]
    fn put_overwrites_atomically() {
        let (_dir, store) = make_store();
        store.put("a/b", b"first").unwrap();
        store.put("a/b", b"second").unwrap();
        assert_eq!(store.get("a/b").unwrap(), b"second");
    }

    #[test]
    fn get_nonexistent_returns_not_found() {
        let (_dir, store) = make_store();
        match store.get("no/such/key") {
            Err(StorageError::NotFound(key)) => assert_eq!(key, "no/such/key"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = make_store();
        store.put("x", b"data").unwrap();
        store.delete("x").unwrap();
        store.delete("x").unwrap();
        assert!(!store.exists("x").unwrap());
    }

    #[test]
    fn exists_after_put() {
        let (_dir, store) = make_store();
        store.put("k", b"v").unwrap();
        assert!(store.exists("k").unwrap());
        assert!(!store.exists("other").unwrap());
    }

    #[test]
    fn list_by_prefix_sorted() {
        let (_dir, store) = make_store();
        store.put("stripes/t/bb", b"2").unwrap();
        store.put("stripes/t/aa", b"1").unwrap();
        store.put("stripes/u/cc", b"3").unwrap();
        store.put("refs/HEAD", b"h").unwrap();

        let keys = store.list("stripes/t/").unwrap();
        assert_eq!(keys, vec!["stripes/t/aa".to_string(), "stripes/t/bb".to_string()]);

        let all_stripes = store.list("stripes/").unwrap();
        assert_eq!(all_stripes.len(), 3);
    }

    #[test]
    fn list_missing_prefix_is_empty() {
        let (_dir, store) = make_store();
        assert!(store.list("nothing/here/").unwrap().is_empty());
    }

    #[test]
    fn empty_blob() {
        let (_dir, store) = make_store();
        store.put("empty", b"").unwrap();
        assert_eq!(store.get("empty").unwrap(), b"");
    }

    #[test]
    fn large_blob() {
        let (_dir, store) = make_store();
        let data = vec![0xABu8; 1_100_000]; // ~1.1 MB
        store.put("big", &data).unwrap();
        assert_eq!(store.get("big").unwrap(), data);
    }

    #[test]
    fn invalid_keys_rejected() {
        let (_dir, store) = make_store();
        assert!(store.put("../escape", b"x").is_err());
        assert!(store.get("a//b").is_err());
    }
}
