//! Local filesystem storage, used by the local executor and available to
//! the remote bootstrap when a job stages through a shared mount.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use super::{Storage, StorageError};

/// Storage over the local filesystem. Parent directories are created on
/// write.
#[derive(Debug, Default, Clone)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }

    fn strip_scheme(path: &str) -> &str {
        path.strip_prefix("file://").unwrap_or(path)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        let path = Self::strip_scheme(path);
        match tokio::fs::read(path).await {
            Ok(data) => Ok(data.into()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                path: path.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        let path = Self::strip_scheme(path);
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &data).await?;
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> Result<(), StorageError> {
        let path = Self::strip_scheme(path);
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> String {
        std::env::temp_dir()
            .join(format!("legate-test-{}", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned()
    }

    #[tokio::test]
    async fn writes_read_back_and_removal_is_recursive() {
        let storage = LocalStorage::new();
        let root = scratch_dir();
        let path = format!("{root}/nested/task.bin");

        storage
            .write(&path, Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(storage.read(&path).await.unwrap(), Bytes::from_static(b"payload"));

        storage.remove_all(&root).await.unwrap();
        assert!(matches!(
            storage.read(&path).await,
            Err(StorageError::NotFound { .. })
        ));
        // Removing an already-deleted tree is fine.
        storage.remove_all(&root).await.unwrap();
    }
}
