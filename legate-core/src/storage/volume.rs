//! Governed-volume storage over the cluster backend's files API.
//!
//! Volume paths (`/Volumes/<catalog>/<schema>/<volume>/…`) are governed
//! locations served by the cluster backend itself. The files API does not
//! create directories implicitly, so every write is preceded by an explicit
//! parent-directory creation call.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use super::{Storage, StorageError};
use crate::resource::ApiCredentials;

#[derive(Deserialize)]
struct DirectoryListing {
    #[serde(default)]
    contents: Vec<DirectoryEntry>,
}

#[derive(Deserialize)]
struct DirectoryEntry {
    path: String,
    #[serde(default)]
    is_directory: bool,
}

/// A client for governed-volume paths.
#[derive(Debug, Clone)]
pub struct VolumeStore {
    client: reqwest::Client,
    credentials: ApiCredentials,
}

impl VolumeStore {
    pub fn new(credentials: ApiCredentials) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
        }
    }

    fn files_url(&self, path: &str) -> String {
        format!(
            "{}/api/2.0/fs/files{}",
            self.credentials.host.trim_end_matches('/'),
            path
        )
    }

    fn directories_url(&self, path: &str) -> String {
        format!(
            "{}/api/2.0/fs/directories{}",
            self.credentials.host.trim_end_matches('/'),
            path
        )
    }

    /// The files API will not create intermediate directories on write, so
    /// the parent has to be created up front.
    async fn ensure_parent(&self, path: &str) -> Result<(), StorageError> {
        let parent = match path.rsplit_once('/') {
            Some((parent, _)) if parent != "/Volumes" && !parent.is_empty() => parent,
            _ => return Ok(()),
        };
        debug!(parent, "creating parent directory");
        self.client
            .put(self.directories_url(parent))
            .bearer_auth(&self.credentials.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Storage for VolumeStore {
    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        let response = self
            .client
            .get(self.files_url(path))
            .bearer_auth(&self.credentials.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                path: path.to_string(),
            });
        }
        Ok(response.error_for_status()?.bytes().await?)
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        self.ensure_parent(path).await?;
        self.client
            .put(self.files_url(path))
            .query(&[("overwrite", "true")])
            .bearer_auth(&self.credentials.token)
            .body(data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> Result<(), StorageError> {
        let listing = self
            .client
            .get(self.directories_url(path))
            .bearer_auth(&self.credentials.token)
            .send()
            .await?;
        if listing.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let listing: DirectoryListing = listing.error_for_status()?.json().await?;

        let deletions = listing
            .contents
            .iter()
            .filter(|entry| !entry.is_directory)
            .map(|entry| async {
                self.client
                    .delete(self.files_url(&entry.path))
                    .bearer_auth(&self.credentials.token)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok::<_, StorageError>(())
            });
        futures::future::try_join_all(deletions).await?;
        self.client
            .delete(self.directories_url(path))
            .bearer_auth(&self.credentials.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
