//! Executor submitting tasks as runs on the cluster service.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::api::{ClusterBackend, HttpClusterBackend};
use super::job::ClusterJob;
use crate::codec::Codec;
use crate::executor::{Executor, ExecutorError, JobStatus, StagingArea};
use crate::resource::ClusterResource;
use crate::storage::{self, Storage};
use crate::task::Task;

/// The bootstrap script uploaded next to the staged task. The container
/// image provides the runner binary; the script hands it the staging path.
const RUN_SCRIPT: &str = "#!/bin/sh\n\
# Uploaded by legate next to the staged task. The first parameter is the\n\
# staging path; the runner loads task.bin from it and writes output.bin.\n\
exec legate-runner \"$1\" false\n";

/// Runs tasks as one-off runs on the managed cluster service.
pub struct ClusterExecutor<T: Task> {
    task: T,
    name: String,
    resource: ClusterResource,
    backend: Arc<dyn ClusterBackend>,
    staging: StagingArea,
    run_id: Option<u64>,
}

impl<T: Task> ClusterExecutor<T> {
    /// Builds an executor over explicit backend and storage handles.
    pub fn new(
        task: T,
        resource: ClusterResource,
        name: impl Into<String>,
        backend: Arc<dyn ClusterBackend>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let location = resource.storage_location();
        Self {
            task,
            name: crate::common::safe_label(&name.into()),
            resource,
            backend,
            staging: StagingArea::new(storage, location),
            run_id: None,
        }
    }

    /// Connects to the service named by the resource's credentials and opens
    /// its storage location.
    pub async fn connect(
        task: T,
        resource: ClusterResource,
        name: impl Into<String>,
    ) -> Result<Self, ExecutorError> {
        let credentials = resource.credentials()?;
        let backend = Arc::new(HttpClusterBackend::new(credentials.clone()));
        let location = resource.storage_location();
        let storage = storage::from_uri(&location, Some(&credentials)).await?;
        Ok(Self::new(task, resource, name, backend, storage))
    }

    #[cfg(test)]
    pub(crate) fn staging_area(&self) -> &StagingArea {
        &self.staging
    }

    /// Resolves the resource's policy name to the backend's policy id.
    async fn resolve_policy(&self) -> Result<String, ExecutorError> {
        let wanted = self.resource.policy_name();
        let policies = self
            .backend
            .list_policies()
            .await
            .map_err(ExecutorError::Backend)?;
        policies
            .into_iter()
            .find(|policy| policy.name == wanted)
            .map(|policy| policy.policy_id)
            .ok_or(ExecutorError::UnknownPolicy { name: wanted })
    }
}

#[async_trait]
impl<T: Task> Executor for ClusterExecutor<T> {
    type Output = T::Output;

    fn name(&self) -> &str {
        &self.name
    }

    async fn stage(&mut self) -> Result<(), ExecutorError> {
        self.staging
            .storage()
            .write(&self.staging.run_script_path(), RUN_SCRIPT.into())
            .await?;
        self.staging
            .stage_task_by_value(
                Codec::default(),
                &self.task,
                &self.resource.register_by_value,
            )
            .await
    }

    async fn start(&mut self) -> Result<String, ExecutorError> {
        let policy_id = self.resolve_policy().await?;
        let job = ClusterJob::new(
            self.name.clone(),
            self.resource.clone(),
            self.staging.path(),
            self.staging.key().to_string(),
            self.staging.run_script_path(),
            policy_id,
        );
        let payload = job.payload();

        let run_id = self
            .backend
            .submit_run(&payload)
            .await
            .map_err(ExecutorError::Backend)?;
        self.run_id = Some(run_id);

        if let Ok(state) = self.backend.get_run(run_id).await {
            if let Some(url) = state.run_page_url {
                info!(%url, "cluster run started");
            }
        }
        Ok(run_id.to_string())
    }

    async fn status(&self) -> Result<JobStatus, ExecutorError> {
        let run_id = self.run_id.ok_or(ExecutorError::NotStarted)?;
        let state = self
            .backend
            .get_run(run_id)
            .await
            .map_err(ExecutorError::Backend)?;
        Ok(state.classify())
    }

    async fn result(&mut self) -> Result<Self::Output, ExecutorError> {
        self.staging.consume_output().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};

    use super::super::api::{ClusterPolicy, RunState};
    use super::super::job::RunSubmission;
    use super::*;
    use crate::storage::memory::InMemoryStorage;

    #[derive(Serialize, Deserialize)]
    struct Double {
        value: i64,
    }

    impl Task for Double {
        type Output = i64;

        fn run(&self) -> anyhow::Result<i64> {
            Ok(self.value * 2)
        }
    }

    /// A scripted cluster service double.
    struct FakeBackend {
        states: Mutex<Vec<serde_json::Value>>,
        submissions: Mutex<Vec<RunSubmission>>,
        status_calls: AtomicUsize,
    }

    impl FakeBackend {
        fn with_states(states: Vec<serde_json::Value>) -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(states),
                submissions: Mutex::new(Vec::new()),
                status_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ClusterBackend for FakeBackend {
        async fn list_policies(&self) -> anyhow::Result<Vec<ClusterPolicy>> {
            Ok(vec![ClusterPolicy {
                name: "shared_default".to_string(),
                policy_id: "policy-1".to_string(),
            }])
        }

        async fn submit_run(&self, payload: &RunSubmission) -> anyhow::Result<u64> {
            self.submissions.lock().unwrap().push(payload.clone());
            Ok(17)
        }

        async fn get_run(&self, _run_id: u64) -> anyhow::Result<RunState> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let mut states = self.states.lock().unwrap();
            let raw = if states.len() > 1 {
                states.remove(0)
            } else {
                states[0].clone()
            };
            Ok(RunState::from_response(raw))
        }
    }

    fn running() -> serde_json::Value {
        serde_json::json!({"state": {"life_cycle_state": "RUNNING"}})
    }

    fn terminal(result: &str) -> serde_json::Value {
        serde_json::json!({
            "state": {"life_cycle_state": "TERMINATED", "result_state": result}
        })
    }

    fn executor(
        backend: Arc<FakeBackend>,
        storage: Arc<InMemoryStorage>,
    ) -> ClusterExecutor<Double> {
        let resource = ClusterResource {
            storage_location: Some("mem://cluster/staging".to_string()),
            ..Default::default()
        };
        ClusterExecutor::new(Double { value: 21 }, resource, "Train Model", backend, storage)
    }

    #[tokio::test]
    async fn cancellation_on_first_poll_raises_with_the_job_name() {
        let backend = FakeBackend::with_states(vec![terminal("CANCELED")]);
        let storage = Arc::new(InMemoryStorage::new());
        let mut executor = executor(backend, storage);

        let err = executor.run().await.unwrap_err();
        match err {
            ExecutorError::Cancelled { name, message } => {
                assert_eq!(name, "train-model");
                assert!(message.contains("CANCELED"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_runs_fetch_and_consume_the_output() {
        let backend = FakeBackend::with_states(vec![terminal("SUCCESS")]);
        let storage = Arc::new(InMemoryStorage::new());
        let mut executor = executor(backend.clone(), storage.clone());

        executor.stage().await.unwrap();
        executor.start().await.unwrap();
        // Stand in for the remote side writing the artifact.
        executor
            .staging_area()
            .write_output(Codec::default(), &42_i64)
            .await
            .unwrap();

        executor.wait().await.unwrap();
        assert_eq!(executor.result().await.unwrap(), 42);
        // The staging directory is consumed with the result.
        assert!(storage.is_empty());
        // Exactly one submission went out.
        assert_eq!(backend.submissions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_is_idempotent_while_executing() {
        let backend = FakeBackend::with_states(vec![running()]);
        let storage = Arc::new(InMemoryStorage::new());
        let mut executor = executor(backend.clone(), storage);

        executor.stage().await.unwrap();
        executor.start().await.unwrap();
        for _ in 0..3 {
            assert_eq!(executor.status().await.unwrap(), JobStatus::Executing);
        }
        // Polling queried the backend each time but never resubmitted.
        assert!(backend.status_calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(backend.submissions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_policies_fail_before_submission() {
        let backend = FakeBackend::with_states(vec![running()]);
        let storage = Arc::new(InMemoryStorage::new());
        let resource = ClusterResource {
            storage_location: Some("mem://cluster/staging".to_string()),
            cluster_policy: Some("gpu_pool".to_string()),
            ..Default::default()
        };
        let mut executor = ClusterExecutor::new(
            Double { value: 1 },
            resource,
            "train",
            backend.clone(),
            storage,
        );

        executor.stage().await.unwrap();
        let err = executor.start().await.unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownPolicy { name } if name == "gpu_pool"));
        assert!(backend.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn staging_uploads_the_bootstrap_script() {
        let backend = FakeBackend::with_states(vec![running()]);
        let storage = Arc::new(InMemoryStorage::new());
        let mut executor = executor(backend, storage.clone());
        executor.stage().await.unwrap();

        let script = storage
            .read(&executor.staging_area().run_script_path())
            .await
            .unwrap();
        assert!(std::str::from_utf8(&script).unwrap().contains("legate-runner"));
    }
}
