//! Simplified interface for interacting with remote storage.
//!
//! Different storage systems expose many different capabilities — we do not
//! attempt to provide a unified interface for all of them. Rather, we
//! provide the bare minimum interface sufficient to satisfy the staging
//! semantics of this system: whole-object reads, whole-object writes, and
//! recursive deletion of a job's staging directory.
//!
//! Backends are selected by the scheme of the storage location:
//!
//! | location                  | backend                               |
//! |---------------------------|---------------------------------------|
//! | `s3://…`, `gs://…`        | [`object::ObjectStore`] (HTTP gateway)|
//! | `/Volumes/…`              | [`volume::VolumeStore`] (files API)   |
//! | `mem://…`                 | [`memory::InMemoryStorage`]           |
//! | `file://…` or a bare path | [`local::LocalStorage`]               |
//!
//! The in-memory backend exists for tests and single-process emulation,
//! playing the same role the in-memory queue plays for a message broker.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::resource::ApiCredentials;

pub mod local;
pub mod memory;
pub mod object;
pub mod volume;

/// Errors produced by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no object at {path}")]
    NotFound { path: String },
    #[error("storage location {0:?} is not supported by any backend")]
    UnsupportedLocation(String),
    #[error("failed to initialize storage client: {0}")]
    Init(String),
    #[error("storage request for {path} failed with status {status}")]
    Response { path: String, status: u16 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// A connection to a storage system.
///
/// Paths are passed through as full location strings (`s3://bucket/key`,
/// `/Volumes/…/key`, a filesystem path); each backend interprets its own
/// scheme.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Reads an entire object.
    async fn read(&self, path: &str) -> Result<Bytes, StorageError>;

    /// Writes an entire object, replacing any previous content.
    async fn write(&self, path: &str, data: Bytes) -> Result<(), StorageError>;

    /// Recursively deletes everything under `path`. Deleting a location that
    /// does not exist is not an error.
    async fn remove_all(&self, path: &str) -> Result<(), StorageError>;
}

/// Joins a storage root and a relative segment with a single separator.
pub fn join(root: &str, segment: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), segment)
}

/// Opens the storage backend responsible for `location`.
///
/// Governed-volume locations require cluster credentials for the files API;
/// object-store locations are reached through the configured HTTP gateway
/// (see [`object`]).
pub async fn from_uri(
    location: &str,
    credentials: Option<&ApiCredentials>,
) -> Result<Arc<dyn Storage>, StorageError> {
    if location.starts_with("/Volumes/") {
        let credentials = credentials.ok_or_else(|| {
            StorageError::Init("governed-volume storage requires cluster credentials".to_string())
        })?;
        return Ok(Arc::new(volume::VolumeStore::new(credentials.clone())));
    }
    if location.starts_with("s3://") || location.starts_with("gs://") {
        return Ok(Arc::new(object::ObjectStore::connect(credentials).await?));
    }
    if let Some(name) = location.strip_prefix("mem://") {
        let name = name.split('/').next().unwrap_or_default();
        return Ok(memory::InMemoryStorage::shared(name));
    }
    if location.starts_with("file://") || !location.contains("://") {
        return Ok(Arc::new(local::LocalStorage::new()));
    }
    Err(StorageError::UnsupportedLocation(location.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_collapses_trailing_separators() {
        assert_eq!(join("s3://bucket/root/", "task.bin"), "s3://bucket/root/task.bin");
        assert_eq!(join("/tmp/stage", "out.bin"), "/tmp/stage/out.bin");
    }

    #[tokio::test]
    async fn volume_locations_require_credentials() {
        let err = from_uri("/Volumes/main/team/vol/", None).await.unwrap_err();
        assert!(matches!(err, StorageError::Init(_)));
    }

    #[tokio::test]
    async fn unknown_schemes_are_rejected() {
        let err = from_uri("ftp://host/path", None).await.unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedLocation(_)));
    }

    #[tokio::test]
    async fn memory_locations_share_state_by_name() {
        let a = from_uri("mem://shared-bucket/run", None).await.unwrap();
        let b = from_uri("mem://shared-bucket/other", None).await.unwrap();
        a.write("mem://shared-bucket/run/x", Bytes::from_static(b"1"))
            .await
            .unwrap();
        assert_eq!(
            b.read("mem://shared-bucket/run/x").await.unwrap(),
            Bytes::from_static(b"1")
        );
    }
}
