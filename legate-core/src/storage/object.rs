//! Object storage reached through an HTTP gateway.
//!
//! Object-store locations (`s3://bucket/key`, `gs://bucket/key`) are served
//! by a gateway that speaks plain HTTP: `GET`/`PUT` on
//! `<gateway>/<bucket>/<key>` and `DELETE …?recursive=true` for staging
//! directories. The gateway address comes from the `LEGATE_OBJECT_GATEWAY`
//! environment variable.
//!
//! Client initialization fetches a short-lived session token. Token issuance
//! is known to race with credential refresh on the gateway side, so the
//! fetch is retried with multiplicative backoff, up to
//! [`MAX_INIT_ATTEMPTS`] attempts, before giving up with a fatal
//! initialization error.

use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{info, warn};

use super::{Storage, StorageError};
use crate::resource::ApiCredentials;

/// Environment variable naming the object-store gateway.
pub const OBJECT_GATEWAY_VAR: &str = "LEGATE_OBJECT_GATEWAY";

/// Bounded attempts for the session-token fetch.
const MAX_INIT_ATTEMPTS: u32 = 6;

#[derive(Deserialize)]
struct SessionToken {
    token: String,
}

/// An object-store client holding a session token for the gateway.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    client: reqwest::Client,
    gateway: String,
    token: String,
}

impl ObjectStore {
    /// Connects to the configured gateway, fetching a session token unless
    /// explicit credentials are supplied.
    pub async fn connect(credentials: Option<&ApiCredentials>) -> Result<Self, StorageError> {
        let gateway = std::env::var(OBJECT_GATEWAY_VAR).map_err(|_| {
            StorageError::Init(format!(
                "object storage gateway not configured; set {OBJECT_GATEWAY_VAR}"
            ))
        })?;
        Self::connect_to(&gateway, credentials).await
    }

    /// Connects to a specific gateway address.
    pub async fn connect_to(
        gateway: &str,
        credentials: Option<&ApiCredentials>,
    ) -> Result<Self, StorageError> {
        let client = reqwest::Client::new();
        let token = match credentials {
            Some(credentials) => credentials.token.clone(),
            None => fetch_session_token(&client, gateway).await?,
        };
        Ok(Self {
            client,
            gateway: gateway.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Maps an `s3://` / `gs://` location onto a gateway URL.
    fn url_for(&self, path: &str) -> Result<String, StorageError> {
        let key = path
            .strip_prefix("s3://")
            .or_else(|| path.strip_prefix("gs://"))
            .ok_or_else(|| StorageError::UnsupportedLocation(path.to_string()))?;
        Ok(format!("{}/{}", self.gateway, key))
    }
}

/// Fetches a session token, retrying the credential-refresh race with
/// multiplicative backoff.
async fn fetch_session_token(
    client: &reqwest::Client,
    gateway: &str,
) -> Result<String, StorageError> {
    let mut policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_multiplier(1.5)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build();

    let url = format!("{}/v1/session-token", gateway.trim_end_matches('/'));
    let mut attempts = 0;
    loop {
        let result = async {
            let response = client.post(&url).send().await?.error_for_status()?;
            let token: SessionToken = response.json().await?;
            Ok::<_, reqwest::Error>(token.token)
        }
        .await;

        match result {
            Ok(token) => return Ok(token),
            Err(err) => {
                attempts += 1;
                if attempts >= MAX_INIT_ATTEMPTS {
                    return Err(StorageError::Init(format!(
                        "failed to obtain an object-store session token after {attempts} attempts: {err}"
                    )));
                }
                let wait = policy
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_secs(1));
                warn!(attempt = attempts, ?wait, error = %err, "session token fetch failed, retrying");
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[async_trait]
impl Storage for ObjectStore {
    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        let url = self.url_for(path)?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                path: path.to_string(),
            });
        }
        let response = response.error_for_status()?;
        Ok(response.bytes().await?)
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        let url = self.url_for(path)?;
        self.client
            .put(&url)
            .bearer_auth(&self.token)
            .body(data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> Result<(), StorageError> {
        let url = self.url_for(path)?;
        let response = self
            .client
            .delete(&url)
            .query(&[("recursive", "true")])
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            info!(path, "staging directory already removed");
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetches_a_session_token_and_round_trips_an_object() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/v1/session-token")
            .with_status(200)
            .with_body(r#"{"token": "abc123"}"#)
            .create_async()
            .await;
        let put_mock = server
            .mock("PUT", "/bucket/run/task.bin")
            .match_header("authorization", "Bearer abc123")
            .with_status(200)
            .create_async()
            .await;
        let get_mock = server
            .mock("GET", "/bucket/run/task.bin")
            .with_status(200)
            .with_body("payload")
            .create_async()
            .await;

        let store = ObjectStore::connect_to(&server.url(), None).await.unwrap();
        store
            .write("s3://bucket/run/task.bin", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        let data = store.read("gs://bucket/run/task.bin").await.unwrap();
        assert_eq!(data, Bytes::from_static(b"payload"));

        token_mock.assert_async().await;
        put_mock.assert_async().await;
        get_mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_objects_surface_as_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/bucket/run/output.bin")
            .with_status(404)
            .create_async()
            .await;

        let credentials = ApiCredentials {
            host: server.url(),
            token: "tok".to_string(),
        };
        let store = ObjectStore::connect_to(&server.url(), Some(&credentials))
            .await
            .unwrap();
        let err = store.read("s3://bucket/run/output.bin").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }
}
