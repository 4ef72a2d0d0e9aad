//! Content-addressed blob storage for image bytes.
//!
//! Blobs are keyed by the hex SHA-256 of their bytes, so two images with the
//! same bytes share one blob. Deciding whether a blob is still referenced is
//! the store's job; backends only put, read and remove.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Content IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Content not found: {0}")]
    NotFound(String),
}

pub type ContentResult<T> = Result<T, ContentError>;

/// Hash used as the content address of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub trait ContentStore: Send + Sync {
    /// Store `bytes` and return their content hash. Storing the same bytes twice is a no-op.
    fn put(&self, bytes: &[u8]) -> ContentResult<String>;

    fn get(&self, hash: &str) -> ContentResult<Vec<u8>>;

    /// Remove the blob. Removing a blob that is already gone succeeds.
    fn remove(&self, hash: &str) -> ContentResult<()>;
}

/// Blobs as files under a root directory, fanned out by the first two hash characters.
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> ContentResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, hash: &str) -> ContentResult<PathBuf> {
        if hash.len() < 3 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ContentError::NotFound(hash.to_string()));
        }
        Ok(self.root.join(&hash[..2]).join(hash))
    }
}

impl ContentStore for FsContentStore {
    fn put(&self, bytes: &[u8]) -> ContentResult<String> {
        let hash = content_hash(bytes);
        let path = self.path_for(&hash)?;
        if !path.exists() {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, bytes)?;
        }
        Ok(hash)
    }

    fn get(&self, hash: &str) -> ContentResult<Vec<u8>> {
        let path = self.path_for(hash)?;
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ContentError::NotFound(hash.to_string()),
            _ => ContentError::Io(e),
        })
    }

    fn remove(&self, hash: &str) -> ContentResult<()> {
        let path = self.path_for(hash)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ContentError::Io(e)),
        }
    }
}

/// In-memory backend used by `Store::in_memory`.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blobs
            .lock()
            .map(|blobs| blobs.contains_key(hash))
            .unwrap_or(false)
    }
}

impl ContentStore for MemoryContentStore {
    fn put(&self, bytes: &[u8]) -> ContentResult<String> {
        let hash = content_hash(bytes);
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs.entry(hash.clone()).or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    fn get(&self, hash: &str) -> ContentResult<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs
            .get(hash)
            .cloned()
            .ok_or_else(|| ContentError::NotFound(hash.to_string()))
    }

    fn remove(&self, hash: &str) -> ContentResult<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs.remove(hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_store_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path()).unwrap();

        let hash = store.put(b"hello").unwrap();
        assert_eq!(hash, content_hash(b"hello"));
        assert_eq!(store.get(&hash).unwrap(), b"hello");

        // Same bytes, same address
        assert_eq!(store.put(b"hello").unwrap(), hash);

        store.remove(&hash).unwrap();
        assert!(matches!(store.get(&hash), Err(ContentError::NotFound(_))));

        // Removing twice is fine
        store.remove(&hash).unwrap();
    }

    #[test]
    fn test_fs_store_rejects_non_hash_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path()).unwrap();
        assert!(matches!(store.get("../etc/passwd"), Err(ContentError::NotFound(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryContentStore::new();
        let hash = store.put(b"bytes").unwrap();
        assert!(store.contains(&hash));
        store.remove(&hash).unwrap();
        assert!(!store.contains(&hash));
    }
}
