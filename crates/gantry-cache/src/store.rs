//! Cache store implementations.

use crate::keys::sanitize_key;
use async_trait::async_trait;
use gantry_core::ports::CacheStore;
use gantry_core::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// In-process store, shared by runs of one engine.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<String> {
        self.entries.write().await.insert(key.to_string(), payload);
        Ok(format!("memory://{}", key))
    }
}

/// Filesystem-backed store; one file per key under `root_dir`.
pub struct FilesystemCacheStore {
    root_dir: PathBuf,
    write_seq: AtomicU64,
}

impl FilesystemCacheStore {
    pub fn new(root_dir: PathBuf) -> Self {
        Self {
            root_dir,
            write_seq: AtomicU64::new(0),
        }
    }

    /// Store rooted in the platform cache directory.
    pub fn default_location() -> Option<Self> {
        let dirs = directories::ProjectDirs::from("dev", "gantry", "gantry")?;
        Some(Self::new(dirs.cache_dir().join("payloads")))
    }

    pub fn root_dir(&self) -> &PathBuf {
        &self.root_dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(format!("{}.tar.zst", sanitize_key(key)))
    }

    /// Remove every stored payload. Returns how many were deleted.
    pub async fn clear(&self) -> Result<usize> {
        if !self.root_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let mut read_dir = tokio::fs::read_dir(&self.root_dir)
            .await
            .map_err(|e| Error::Cache(format!("failed to read cache dir: {}", e)))?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| Error::Cache(format!("failed to read entry: {}", e)))?
        {
            if entry.path().is_file() {
                tokio::fs::remove_file(entry.path())
                    .await
                    .map_err(|e| Error::Cache(format!("failed to delete cache: {}", e)))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheStore for FilesystemCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Cache(format!("failed to read cache: {}", e))),
        }
    }

    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<String> {
        let path = self.key_path(key);
        tokio::fs::create_dir_all(&self.root_dir)
            .await
            .map_err(|e| Error::Cache(format!("failed to create cache dir: {}", e)))?;

        // Concurrent writers each use their own temp file; the last rename wins.
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp.{}.{}", std::process::id(), seq));
        tokio::fs::write(&tmp, &payload)
            .await
            .map_err(|e| Error::Cache(format!("failed to write cache: {}", e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Cache(format!("failed to commit cache: {}", e)))?;

        debug!(key = %key, path = %path.display(), bytes = payload.len(), "Cache entry written");
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_miss_then_hit() {
        let store = MemoryCacheStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        let locator = store.put("k", b"payload".to_vec()).await.unwrap();
        assert_eq!(locator, "memory://k");
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_filesystem_store_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCacheStore::new(dir.path().join("cache"));

        assert!(store.get("cargo/linux").await.unwrap().is_none());
        store.put("cargo/linux", b"first".to_vec()).await.unwrap();
        store.put("cargo/linux", b"second".to_vec()).await.unwrap();

        assert_eq!(store.get("cargo/linux").await.unwrap().unwrap(), b"second");
        assert_eq!(store.clear().await.unwrap(), 1);
        assert!(store.get("cargo/linux").await.unwrap().is_none());
    }
}
