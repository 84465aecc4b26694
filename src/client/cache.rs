//! Small key-value cache for values that should survive a restart,
//! such as the last known unread counts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use crate::errors::AppError;

pub struct KvCache {
    entries: RwLock<HashMap<String, String>>,
    path: Option<PathBuf>,
}

impl KvCache {
    /// A cache that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Load a cache file, starting empty when it does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("Discarding unreadable cache {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(AppError::Internal(format!(
                    "Failed to read cache {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
        })
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).await.and_then(|v| v.parse().ok())
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.into());
        self.persist(&entries).await;
    }

    pub async fn set_i64(&self, key: &str, value: i64) {
        self.set(key, value.to_string()).await;
    }

    pub async fn remove(&self, key: &str) {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            self.persist(&entries).await;
        }
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
        self.persist(&entries).await;
    }

    /// Write-through. A failed write only costs the value on the next start.
    async fn persist(&self, entries: &HashMap<String, String>) {
        let Some(path) = &self.path else {
            return;
        };
        let text = match serde_json::to_string(entries) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Cache could not be encoded: {}", e);
                return;
            }
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!("Failed to create cache directory {}: {}", parent.display(), e);
                return;
            }
        }
        if let Err(e) = tokio::fs::write(path, text).await {
            tracing::warn!("Failed to write cache {}: {}", path.display(), e);
        }
    }
}

impl Default for KvCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_values() {
        let cache = KvCache::in_memory();
        assert!(cache.get("missing").await.is_none());

        cache.set_i64("unread", 4).await;
        assert_eq!(cache.get_i64("unread").await, Some(4));

        cache.set("unread", "not a number").await;
        assert_eq!(cache.get_i64("unread").await, None);

        cache.remove("unread").await;
        assert!(cache.get("unread").await.is_none());
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        let cache = KvCache::open(&path).await.unwrap();
        cache.set_i64("unread_messages:u1", 7).await;
        drop(cache);

        let reopened = KvCache::open(&path).await.unwrap();
        assert_eq!(reopened.get_i64("unread_messages:u1").await, Some(7));

        reopened.clear().await;
        let emptied = KvCache::open(&path).await.unwrap();
        assert!(emptied.get("unread_messages:u1").await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        tokio::fs::write(&path, "{oops").await.unwrap();

        let cache = KvCache::open(&path).await.unwrap();
        assert!(cache.get("anything").await.is_none());
    }
}
