//! In-memory storage, for tests and single-process emulation.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::{Storage, StorageError};

static SHARED: OnceLock<DashMap<String, Arc<InMemoryStorage>>> = OnceLock::new();

/// A storage backend over a concurrent map. Instances returned by
/// [`shared`](Self::shared) for the same name see the same objects, which
/// lets a test play both sides of the staging protocol in one process.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    objects: DashMap<String, Bytes>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance registered under `name` (the authority of a
    /// `mem://name/...` location).
    pub fn shared(name: &str) -> Arc<Self> {
        let registry = SHARED.get_or_init(DashMap::new);
        registry
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Self::new()))
            .clone()
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        self.objects
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound {
                path: path.to_string(),
            })
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        self.objects.insert(path.to_string(), data);
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> Result<(), StorageError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.objects
            .retain(|key, _| key != path && !key.starts_with(&prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_all_only_touches_the_prefix() {
        let storage = InMemoryStorage::new();
        storage
            .write("root/a/task.bin", Bytes::from_static(b"1"))
            .await
            .unwrap();
        storage
            .write("root/ab/task.bin", Bytes::from_static(b"2"))
            .await
            .unwrap();

        storage.remove_all("root/a").await.unwrap();

        assert!(matches!(
            storage.read("root/a/task.bin").await,
            Err(StorageError::NotFound { .. })
        ));
        assert_eq!(
            storage.read("root/ab/task.bin").await.unwrap(),
            Bytes::from_static(b"2")
        );
    }
}
