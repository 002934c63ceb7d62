//! The cluster service's RPC surface, reduced to the three calls the
//! executor needs: policy listing, run submission, and run state retrieval.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::job::RunSubmission;
use crate::executor::JobStatus;
use crate::resource::ApiCredentials;

/// Run API version. Runs submitted with older versions are not viewable in
/// the service console.
const RUNS_API_VERSION: &str = "2.1";

/// A cluster policy as returned by the policy listing.
#[derive(Deserialize, Debug, Clone)]
pub struct ClusterPolicy {
    pub name: String,
    pub policy_id: String,
}

#[derive(Deserialize)]
struct PolicyListing {
    #[serde(default)]
    policies: Vec<ClusterPolicy>,
}

#[derive(Deserialize)]
struct SubmittedRun {
    run_id: u64,
}

/// The state of a submitted run, as reported by the service.
///
/// `raw` preserves the service's full response so terminal failures can be
/// surfaced verbatim.
#[derive(Debug, Clone)]
pub struct RunState {
    pub life_cycle_state: String,
    pub result_state: Option<String>,
    pub run_page_url: Option<String>,
    pub raw: serde_json::Value,
}

impl RunState {
    pub fn from_response(raw: serde_json::Value) -> Self {
        let state = raw.get("state").cloned().unwrap_or_default();
        Self {
            life_cycle_state: state
                .get("life_cycle_state")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            result_state: state
                .get("result_state")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            run_page_url: raw
                .get("run_page_url")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            raw,
        }
    }

    /// Collapses the service's two-level state into the logical job status.
    pub fn classify(&self) -> JobStatus {
        if matches!(self.life_cycle_state.as_str(), "PENDING" | "RUNNING") {
            return JobStatus::Executing;
        }
        match self.result_state.as_deref() {
            Some("SUCCESS") => JobStatus::Succeeded,
            Some("CANCELED") => JobStatus::Cancelled {
                message: self.raw.to_string(),
            },
            _ => JobStatus::Failed {
                message: self.raw.to_string(),
            },
        }
    }
}

/// The cluster service as the executor sees it.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn list_policies(&self) -> Result<Vec<ClusterPolicy>>;
    async fn submit_run(&self, payload: &RunSubmission) -> Result<u64>;
    async fn get_run(&self, run_id: u64) -> Result<RunState>;
}

/// HTTP client for the cluster service.
#[derive(Debug, Clone)]
pub struct HttpClusterBackend {
    client: reqwest::Client,
    credentials: ApiCredentials,
}

impl HttpClusterBackend {
    pub fn new(credentials: ApiCredentials) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.credentials.host.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ClusterBackend for HttpClusterBackend {
    async fn list_policies(&self) -> Result<Vec<ClusterPolicy>> {
        let listing: PolicyListing = self
            .client
            .get(self.url("/api/2.0/policies/clusters/list"))
            .bearer_auth(&self.credentials.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed policy listing")?;
        Ok(listing.policies)
    }

    async fn submit_run(&self, payload: &RunSubmission) -> Result<u64> {
        let submitted: SubmittedRun = self
            .client
            .post(self.url(&format!("/api/{RUNS_API_VERSION}/jobs/runs/submit")))
            .bearer_auth(&self.credentials.token)
            .json(payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed run submission response")?;
        Ok(submitted.run_id)
    }

    async fn get_run(&self, run_id: u64) -> Result<RunState> {
        let raw: serde_json::Value = self
            .client
            .get(self.url(&format!("/api/{RUNS_API_VERSION}/jobs/runs/get")))
            .query(&[("run_id", run_id.to_string())])
            .bearer_auth(&self.credentials.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed run state response")?;
        Ok(RunState::from_response(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(life_cycle: &str, result: Option<&str>) -> RunState {
        RunState::from_response(serde_json::json!({
            "state": {
                "life_cycle_state": life_cycle,
                "result_state": result,
            }
        }))
    }

    #[test]
    fn collapses_service_states() {
        assert_eq!(state("PENDING", None).classify(), JobStatus::Executing);
        assert_eq!(state("RUNNING", None).classify(), JobStatus::Executing);
        assert_eq!(
            state("TERMINATED", Some("SUCCESS")).classify(),
            JobStatus::Succeeded
        );
        assert!(matches!(
            state("TERMINATED", Some("CANCELED")).classify(),
            JobStatus::Cancelled { .. }
        ));
        assert!(matches!(
            state("INTERNAL_ERROR", None).classify(),
            JobStatus::Failed { .. }
        ));
    }

    #[test]
    fn terminal_failures_carry_the_raw_state() {
        let failed = state("TERMINATED", Some("FAILED"));
        match failed.classify() {
            JobStatus::Failed { message } => assert!(message.contains("FAILED")),
            other => panic!("unexpected status: {other:?}"),
        }
    }
}
