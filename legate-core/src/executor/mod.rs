//! The executor lifecycle.
//!
//! An [`Executor`] owns the full life of one remote job: it lays out a
//! unique staging directory, serializes the task into it, submits a
//! backend-specific job payload, polls the backend until the job reaches a
//! terminal state, and materializes the task's return value locally.
//!
//! # Semantic overview
//!
//! - [`stage`](Executor::stage) serializes the task to
//!   `<storage_root>/<key>/task.bin`. Safe to call exactly once per run.
//! - [`start`](Executor::start) submits the job payload and returns the
//!   backend's opaque job handle.
//! - [`status`](Executor::status) queries the backend. It is a pure read:
//!   calling it repeatedly never changes the remote job.
//! - [`result`](Executor::result) reads `output.bin`, then deletes the whole
//!   staging directory. Result retrieval is a consuming operation, not an
//!   idempotent one.
//! - [`run`](Executor::run) strings the above together and is the only entry
//!   point most callers touch.
//!
//! The poll loop uses a fixed interval with no client-side timeout: target
//! workloads run for hours to days, where sub-minute polling precision is
//! irrelevant and the backend's own timeout is authoritative.
//!
//! Three executors implement the contract: [`local::LocalExecutor`],
//! [`cluster::ClusterExecutor`], and [`training::TrainingExecutor`] (plus
//! its tuning twin [`training::TuningExecutor`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::{self, Codec, Payload};
use crate::common::LabelError;
use crate::distributed::DistributedJob;
use crate::resource::ResourceError;
use crate::storage::{self, Storage, StorageError};

pub mod cluster;
pub mod local;
pub mod training;

/// Staged task artifact.
pub const TASK_FILENAME: &str = "task.bin";
/// Output artifact written by the remote side.
pub const OUTPUT_FILENAME: &str = "output.bin";
/// Serialized distributed-job descriptor, present only for distributed jobs.
pub const DISTRIBUTED_JOB_FILENAME: &str = "distributed.bin";
/// Bootstrap script uploaded for cluster-service jobs.
pub const RUN_SCRIPT_FILENAME: &str = "run.sh";
/// Metrics reported by a tuning trial.
pub const METRICS_FILENAME: &str = "metrics.json";

/// Interval between status polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Errors raised across the executor lifecycle.
///
/// Configuration problems surface before any remote call; backend terminal
/// states carry the raw status payload so the job can be looked up in the
/// backend's own console.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("job {name} was cancelled: {message}")]
    Cancelled { name: String, message: String },
    #[error("job {name} failed: {message}")]
    Failed { name: String, message: String },
    #[error("job reported success but no output artifact exists at {path}")]
    MissingOutput { path: String },
    #[error("environment is incomplete, missing: {}; provide the fields explicitly or run where ambient context is available", missing.join(", "))]
    IncompleteEnvironment { missing: Vec<&'static str> },
    #[error("no cluster policy named {name:?}")]
    UnknownPolicy { name: String },
    #[error("status requested before the job was started")]
    NotStarted,
    #[error(transparent)]
    InvalidResource(#[from] ResourceError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    InvalidLabel(#[from] LabelError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to encode or decode a staged payload: {0}")]
    Codec(#[source] anyhow::Error),
    #[error("backend request failed: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Logical job state, collapsed from each backend's own enumeration.
///
/// `Executing` transitions to exactly one of the other states; nothing
/// transitions out of a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Executing,
    Succeeded,
    Cancelled { message: String },
    Failed { message: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Executing)
    }
}

/// The interface to run a task on some arbitrary resource.
///
/// Implementations provide the four backend-specific operations; the
/// provided [`run`](Self::run) drives them through the shared lifecycle.
#[async_trait]
pub trait Executor: Send {
    type Output: Payload;

    /// Display name of the job, used in errors and logging.
    fn name(&self) -> &str;

    /// Serializes the task (and any auxiliary descriptors) into the staging
    /// directory.
    async fn stage(&mut self) -> Result<(), ExecutorError>;

    /// Submits the job to the backend and returns its opaque handle.
    async fn start(&mut self) -> Result<String, ExecutorError>;

    /// Queries the backend for the job's current state.
    async fn status(&self) -> Result<JobStatus, ExecutorError>;

    /// Materializes the output artifact and tears down the staging
    /// directory.
    async fn result(&mut self) -> Result<Self::Output, ExecutorError>;

    /// Polls until the job leaves `Executing`, mapping terminal failures to
    /// their distinguished errors.
    async fn wait(&mut self) -> Result<(), ExecutorError> {
        loop {
            match self.status().await? {
                JobStatus::Executing => tokio::time::sleep(POLL_INTERVAL).await,
                JobStatus::Succeeded => return Ok(()),
                JobStatus::Cancelled { message } => {
                    return Err(ExecutorError::Cancelled {
                        name: self.name().to_string(),
                        message,
                    })
                }
                JobStatus::Failed { message } => {
                    return Err(ExecutorError::Failed {
                        name: self.name().to_string(),
                        message,
                    })
                }
            }
        }
    }

    /// Runs the full lifecycle and returns the task's output.
    async fn run(&mut self) -> Result<Self::Output, ExecutorError> {
        self.stage().await?;
        let handle = self.start().await?;
        info!(job = %handle, "submitted job");
        self.wait().await?;
        self.result().await
    }
}

/// The staging directory of one job: a unique key under the resource's
/// storage root, owned exclusively by one executor for the duration of its
/// run.
pub struct StagingArea {
    storage: Arc<dyn Storage>,
    root: String,
    key: String,
}

impl StagingArea {
    pub fn new(storage: Arc<dyn Storage>, root: impl Into<String>) -> Self {
        Self {
            storage,
            root: root.into(),
            key: Uuid::new_v4().to_string(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The unique storage key namespacing this job's artifacts.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `<storage_root>/<key>`
    pub fn path(&self) -> String {
        storage::join(&self.root, &self.key)
    }

    pub fn task_path(&self) -> String {
        storage::join(&self.path(), TASK_FILENAME)
    }

    pub fn output_path(&self) -> String {
        storage::join(&self.path(), OUTPUT_FILENAME)
    }

    pub fn distributed_job_path(&self) -> String {
        storage::join(&self.path(), DISTRIBUTED_JOB_FILENAME)
    }

    pub fn run_script_path(&self) -> String {
        storage::join(&self.path(), RUN_SCRIPT_FILENAME)
    }

    /// Serializes the task into the staging directory.
    pub async fn stage_task<T: Serialize>(
        &self,
        codec: Codec,
        task: &T,
    ) -> Result<(), ExecutorError> {
        let bytes = codec::stage(codec, task).map_err(ExecutorError::Codec)?;
        self.storage.write(&self.task_path(), bytes).await?;
        Ok(())
    }

    /// Serializes the task while holding the by-value registration scope for
    /// `modules`.
    pub async fn stage_task_by_value<T: Serialize>(
        &self,
        codec: Codec,
        task: &T,
        modules: &[String],
    ) -> Result<(), ExecutorError> {
        let bytes =
            codec::stage_with_by_value(codec, task, modules).map_err(ExecutorError::Codec)?;
        self.storage.write(&self.task_path(), bytes).await?;
        Ok(())
    }

    /// Ships the distributed-job descriptor alongside the task.
    pub async fn stage_distributed_job(&self, job: &DistributedJob) -> Result<(), ExecutorError> {
        let bytes = codec::stage(Codec::default(), job).map_err(ExecutorError::Codec)?;
        self.storage.write(&self.distributed_job_path(), bytes).await?;
        Ok(())
    }

    /// Writes the output artifact. Used by the local executor, which plays
    /// both sides of the protocol.
    pub async fn write_output<O: Serialize>(
        &self,
        codec: Codec,
        value: &O,
    ) -> Result<(), ExecutorError> {
        let bytes = codec::stage(codec, value).map_err(ExecutorError::Codec)?;
        self.storage.write(&self.output_path(), bytes).await?;
        Ok(())
    }

    /// Reads the output artifact, then deletes the staging directory.
    ///
    /// A missing artifact after a reported success is a data-integrity
    /// fault, not a backend fault. Cleanup failures are logged, never
    /// raised.
    pub async fn consume_output<O: DeserializeOwned>(&self) -> Result<O, ExecutorError> {
        let output_path = self.output_path();
        let bytes = match self.storage.read(&output_path).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound { path }) => {
                return Err(ExecutorError::MissingOutput { path })
            }
            Err(err) => return Err(err.into()),
        };
        let value = codec::load_staged(&bytes).map_err(ExecutorError::Codec)?;
        if let Err(err) = self.storage.remove_all(&self.path()).await {
            warn!(path = %self.path(), error = %err, "failed to clean up staging directory");
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorage;

    struct ScriptedExecutor {
        statuses: std::sync::Mutex<Vec<JobStatus>>,
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        type Output = u64;

        fn name(&self) -> &str {
            "scripted"
        }

        async fn stage(&mut self) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn start(&mut self) -> Result<String, ExecutorError> {
            Ok("job-1".to_string())
        }

        async fn status(&self) -> Result<JobStatus, ExecutorError> {
            Ok(self.statuses.lock().unwrap().remove(0))
        }

        async fn result(&mut self) -> Result<u64, ExecutorError> {
            Ok(7)
        }
    }

    #[tokio::test]
    async fn run_surfaces_cancellation_with_the_job_name() {
        let mut executor = ScriptedExecutor {
            statuses: std::sync::Mutex::new(vec![JobStatus::Cancelled {
                message: "cancelled from the console".to_string(),
            }]),
        };
        let err = executor.run().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("scripted"), "missing job name: {message}");
        assert!(matches!(err, ExecutorError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn run_returns_the_result_on_success() {
        let mut executor = ScriptedExecutor {
            statuses: std::sync::Mutex::new(vec![JobStatus::Succeeded]),
        };
        assert_eq!(executor.run().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn consume_output_deletes_the_staging_directory() {
        let storage = Arc::new(InMemoryStorage::new());
        let area = StagingArea::new(storage.clone(), "mem://bucket/staging");
        area.write_output(Codec::default(), &41_u64).await.unwrap();

        let value: u64 = area.consume_output().await.unwrap();
        assert_eq!(value, 41);
        assert!(storage.is_empty());

        // The read is consuming: a second retrieval reports the integrity
        // fault.
        let err = area.consume_output::<u64>().await.unwrap_err();
        assert!(matches!(err, ExecutorError::MissingOutput { .. }));
    }

    #[tokio::test]
    async fn missing_output_is_an_integrity_fault() {
        let storage = Arc::new(InMemoryStorage::new());
        let area = StagingArea::new(storage, "mem://bucket/staging");
        let err = area.consume_output::<u64>().await.unwrap_err();
        assert!(matches!(err, ExecutorError::MissingOutput { .. }));
    }
}
