//! The training service's RPC surface: custom jobs, tuning jobs, and
//! persistent resource pools.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::job::{JobPayload, PoolPayload, TuningJobPayload};
use super::tune::{Goal, TrialReport};
use crate::executor::JobStatus;
use crate::task::ParamValue;

/// Optional bearer token for the training service.
pub const TRAINING_TOKEN_VAR: &str = "LEGATE_TRAINING_TOKEN";

/// The service's own job-state enumeration.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingJobState {
    #[serde(rename = "JOB_STATE_QUEUED")]
    Queued,
    #[serde(rename = "JOB_STATE_PENDING")]
    Pending,
    #[serde(rename = "JOB_STATE_RUNNING")]
    Running,
    #[serde(rename = "JOB_STATE_PAUSED")]
    Paused,
    #[serde(rename = "JOB_STATE_SUCCEEDED")]
    Succeeded,
    #[serde(rename = "JOB_STATE_FAILED")]
    Failed,
    #[serde(rename = "JOB_STATE_CANCELLING")]
    Cancelling,
    #[serde(rename = "JOB_STATE_CANCELLED")]
    Cancelled,
    #[serde(rename = "JOB_STATE_EXPIRED")]
    Expired,
    #[serde(other)]
    Unspecified,
}

/// A job's reported state plus the service's error payload, if any.
#[derive(Deserialize, Debug, Clone)]
pub struct TrainingStatus {
    pub state: TrainingJobState,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl TrainingStatus {
    fn message(&self) -> String {
        self.error
            .as_ref()
            .map(|error| error.to_string())
            .unwrap_or_default()
    }

    /// Collapses the service states into the logical job status.
    pub fn classify(&self) -> JobStatus {
        use TrainingJobState::*;
        match self.state {
            Unspecified | Queued | Pending | Running | Paused => JobStatus::Executing,
            Succeeded => JobStatus::Succeeded,
            Cancelling | Cancelled => JobStatus::Cancelled {
                message: self.message(),
            },
            Failed | Expired => JobStatus::Failed {
                message: self.message(),
            },
        }
    }
}

#[derive(Deserialize)]
struct CreatedJob {
    name: String,
}

#[derive(Deserialize)]
struct ApiMetric {
    value: f64,
}

#[derive(Deserialize)]
struct ApiMeasurement {
    #[serde(default)]
    metrics: Vec<ApiMetric>,
}

#[derive(Deserialize)]
struct ApiTrialParameter {
    parameter_id: String,
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct ApiTrial {
    id: String,
    state: String,
    #[serde(default)]
    final_measurement: Option<ApiMeasurement>,
    #[serde(default)]
    parameters: Vec<ApiTrialParameter>,
}

impl ApiTrial {
    fn into_report(self) -> TrialReport {
        let metric = self
            .final_measurement
            .and_then(|m| m.metrics.first().map(|metric| metric.value))
            .unwrap_or(f64::NAN);
        let parameters: BTreeMap<String, ParamValue> = self
            .parameters
            .into_iter()
            .map(|parameter| {
                let value = match parameter.value {
                    serde_json::Value::Number(number) => match number.as_i64() {
                        Some(int) => ParamValue::Int(int),
                        None => ParamValue::Float(number.as_f64().unwrap_or(f64::NAN)),
                    },
                    serde_json::Value::Bool(flag) => ParamValue::Bool(flag),
                    other => ParamValue::parse(other.as_str().unwrap_or_default()),
                };
                (parameter.parameter_id, value)
            })
            .collect();
        TrialReport {
            trial_id: self.id,
            state: self.state,
            metric,
            parameters,
        }
    }
}

#[derive(Deserialize)]
struct ApiStudyMetric {
    #[serde(default)]
    goal: String,
}

#[derive(Deserialize)]
struct ApiStudySpec {
    #[serde(default)]
    metrics: Vec<ApiStudyMetric>,
}

#[derive(Deserialize)]
struct ApiTuningJob {
    #[serde(flatten)]
    status: TrainingStatus,
    #[serde(default)]
    study_spec: Option<ApiStudySpec>,
    #[serde(default)]
    trials: Vec<ApiTrial>,
}

/// A tuning job's state and its trials, as the executor consumes them.
#[derive(Debug, Clone)]
pub struct TuningJobReport {
    pub status: TrainingStatus,
    pub goal: Goal,
    pub trials: Vec<TrialReport>,
}

/// The training service as the executors and the CLI see it.
#[async_trait]
pub trait TrainingBackend: Send + Sync {
    async fn create_job(&self, parent: &str, payload: &JobPayload) -> Result<String>;
    async fn get_job(&self, name: &str) -> Result<TrainingStatus>;
    async fn create_tuning_job(&self, parent: &str, payload: &TuningJobPayload)
        -> Result<String>;
    async fn get_tuning_job(&self, name: &str) -> Result<TuningJobReport>;
    async fn create_pool(&self, parent: &str, pool_id: &str, payload: &PoolPayload)
        -> Result<String>;
    async fn list_pools(&self, parent: &str) -> Result<serde_json::Value>;
    async fn delete_pool(&self, name: &str) -> Result<()>;
    async fn list_jobs(&self, parent: &str) -> Result<serde_json::Value>;
}

/// HTTP client for the training service's regional endpoint.
#[derive(Debug, Clone)]
pub struct HttpTrainingBackend {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpTrainingBackend {
    /// Connects to the regional API endpoint.
    pub fn for_region(region: &str) -> Self {
        Self::with_endpoint(format!("https://{region}-aiplatform.googleapis.com/v1"))
    }

    /// Connects to an explicit endpoint. Used by tests and private
    /// deployments.
    pub fn with_endpoint(base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
            token: std::env::var(TRAINING_TOKEN_VAR).ok(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl TrainingBackend for HttpTrainingBackend {
    async fn create_job(&self, parent: &str, payload: &JobPayload) -> Result<String> {
        let created: CreatedJob = self
            .request(self.client.post(self.url(&format!("{parent}/customJobs"))))
            .json(payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed job creation response")?;
        Ok(created.name)
    }

    async fn get_job(&self, name: &str) -> Result<TrainingStatus> {
        Ok(self
            .request(self.client.get(self.url(name)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed job state response")?)
    }

    async fn create_tuning_job(
        &self,
        parent: &str,
        payload: &TuningJobPayload,
    ) -> Result<String> {
        let created: CreatedJob = self
            .request(
                self.client
                    .post(self.url(&format!("{parent}/hyperparameterTuningJobs"))),
            )
            .json(payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed tuning job creation response")?;
        Ok(created.name)
    }

    async fn get_tuning_job(&self, name: &str) -> Result<TuningJobReport> {
        let job: ApiTuningJob = self
            .request(self.client.get(self.url(name)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed tuning job response")?;
        let goal = match job.study_spec {
            Some(spec) if spec.metrics.first().is_some_and(|m| m.goal.contains("MIN")) => {
                Goal::Minimize
            }
            _ => Goal::Maximize,
        };
        Ok(TuningJobReport {
            status: job.status,
            goal,
            trials: job.trials.into_iter().map(ApiTrial::into_report).collect(),
        })
    }

    async fn create_pool(
        &self,
        parent: &str,
        pool_id: &str,
        payload: &PoolPayload,
    ) -> Result<String> {
        let created: CreatedJob = self
            .request(
                self.client
                    .post(self.url(&format!("{parent}/persistentResources")))
                    .query(&[("persistent_resource_id", pool_id)]),
            )
            .json(payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed pool creation response")?;
        Ok(created.name)
    }

    async fn list_pools(&self, parent: &str) -> Result<serde_json::Value> {
        Ok(self
            .request(
                self.client
                    .get(self.url(&format!("{parent}/persistentResources"))),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        self.request(self.client.delete(self.url(name)))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list_jobs(&self, parent: &str) -> Result<serde_json::Value> {
        Ok(self
            .request(self.client.get(self.url(&format!("{parent}/customJobs"))))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: &str) -> TrainingStatus {
        serde_json::from_value(serde_json::json!({ "state": state })).unwrap()
    }

    #[test]
    fn collapses_service_states() {
        for executing in [
            "JOB_STATE_QUEUED",
            "JOB_STATE_PENDING",
            "JOB_STATE_RUNNING",
            "JOB_STATE_PAUSED",
            "JOB_STATE_SOMETHING_NEW",
        ] {
            assert_eq!(status(executing).classify(), JobStatus::Executing);
        }
        assert_eq!(
            status("JOB_STATE_SUCCEEDED").classify(),
            JobStatus::Succeeded
        );
        assert!(matches!(
            status("JOB_STATE_CANCELLING").classify(),
            JobStatus::Cancelled { .. }
        ));
        assert!(matches!(
            status("JOB_STATE_CANCELLED").classify(),
            JobStatus::Cancelled { .. }
        ));
        assert!(matches!(
            status("JOB_STATE_FAILED").classify(),
            JobStatus::Failed { .. }
        ));
    }

    #[test]
    fn trial_responses_flatten_into_reports() {
        let trial: ApiTrial = serde_json::from_value(serde_json::json!({
            "id": "3",
            "state": "SUCCEEDED",
            "final_measurement": {"metrics": [{"value": 0.93}]},
            "parameters": [
                {"parameter_id": "learning_rate", "value": 0.01},
                {"parameter_id": "layers", "value": 4},
                {"parameter_id": "optimizer", "value": "adamw"},
            ],
        }))
        .unwrap();
        let report = trial.into_report();
        assert_eq!(report.metric, 0.93);
        assert_eq!(
            report.parameters.get("layers"),
            Some(&ParamValue::Int(4))
        );
        assert_eq!(
            report.parameters.get("optimizer"),
            Some(&ParamValue::Text("adamw".to_string()))
        );
    }
}
