//! Executors submitting jobs to the training service.
//!
//! [`TrainingExecutor`] runs a single task as a custom job.
//! [`TuningExecutor`] runs a tunable task as a hyperparameter study; its
//! result is the reduced study outcome rather than an output artifact.
//!
//! Both require a complete environment at construction time. Ambient
//! resolution happens earlier, in [`remote`](crate::remote), on an owned
//! copy of the descriptor; an executor never mutates its resource.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::api::{HttpTrainingBackend, TrainingBackend};
use super::job::TrainingJob;
use super::tune::{self, Tune, TuneResult};
use crate::codec::Codec;
use crate::executor::{Executor, ExecutorError, JobStatus, StagingArea};
use crate::resource::{EnvironmentConfig, TrainingResource};
use crate::storage::{self, Storage};
use crate::task::{Task, TunableTask};

/// Shared submission state: the resolved environment, the staging area, and
/// the backend handle.
struct JobContext {
    resource: TrainingResource,
    environment: EnvironmentConfig,
    name: String,
    labels: BTreeMap<String, String>,
    web_console: bool,
    code_package: Option<String>,
    backend: Arc<dyn TrainingBackend>,
    staging: StagingArea,
    handle: Option<String>,
}

impl JobContext {
    fn new(
        resource: TrainingResource,
        name: String,
        labels: BTreeMap<String, String>,
        web_console: bool,
        code_package: Option<String>,
        backend: Arc<dyn TrainingBackend>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, ExecutorError> {
        resource.validate()?;
        let environment = resource.environment.clone().unwrap_or_default();
        if !environment.is_complete() {
            return Err(ExecutorError::IncompleteEnvironment {
                missing: environment.missing_fields(),
            });
        }
        let location = environment
            .storage_location()
            .expect("complete environments have a storage location");
        Ok(Self {
            resource,
            environment,
            name,
            labels,
            web_console,
            code_package,
            backend,
            staging: StagingArea::new(storage, location),
            handle: None,
        })
    }

    /// `projects/<project>/locations/<region>`
    fn parent(&self) -> String {
        format!(
            "projects/{}/locations/{}",
            self.environment.project.as_deref().unwrap_or_default(),
            self.environment.region.as_deref().unwrap_or_default(),
        )
    }

    fn job(&self, tune: Option<Tune>) -> TrainingJob {
        TrainingJob {
            display_name: self.name.clone(),
            resource: self.resource.clone(),
            environment: self.environment.clone(),
            storage_path: self.staging.path(),
            dashboard: false,
            web_console: self.web_console,
            labels: self.labels.clone(),
            code_package: self.code_package.clone(),
            tune,
        }
    }

    fn handle(&self) -> Result<&str, ExecutorError> {
        self.handle.as_deref().ok_or(ExecutorError::NotStarted)
    }

    /// Console lookup path for the created job, mirroring the service's UI
    /// layout.
    fn log_console_path(&self, handle: &str) {
        if let Some((_, job_id)) = handle.rsplit_once('/') {
            let region = self.environment.region.as_deref().unwrap_or_default();
            info!(
                job = handle,
                "job logs available under locations/{region}/training/{job_id}"
            );
        }
    }
}

/// Runs a [`Task`] as a custom job on the training service.
pub struct TrainingExecutor<T: Task> {
    task: T,
    context: JobContext,
}

impl<T: Task> TrainingExecutor<T> {
    /// Builds an executor over explicit backend and storage handles. The
    /// resource's environment must already be complete.
    pub fn new(
        task: T,
        resource: TrainingResource,
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
        web_console: bool,
        code_package: Option<String>,
        backend: Arc<dyn TrainingBackend>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, ExecutorError> {
        Ok(Self {
            task,
            context: JobContext::new(
                resource,
                name.into(),
                labels,
                web_console,
                code_package,
                backend,
                storage,
            )?,
        })
    }

    /// Connects to the resource's regional endpoint and storage location.
    pub async fn connect(
        task: T,
        resource: TrainingResource,
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
        web_console: bool,
        code_package: Option<String>,
    ) -> Result<Self, ExecutorError> {
        let (backend, storage) = connect_backend(&resource).await?;
        Self::new(
            task,
            resource,
            name,
            labels,
            web_console,
            code_package,
            backend,
            storage,
        )
    }

    #[cfg(test)]
    pub(crate) fn staging_area(&self) -> &StagingArea {
        &self.context.staging
    }
}

async fn connect_backend(
    resource: &TrainingResource,
) -> Result<(Arc<dyn TrainingBackend>, Arc<dyn Storage>), ExecutorError> {
    let environment = resource.environment.clone().unwrap_or_default();
    if !environment.is_complete() {
        return Err(ExecutorError::IncompleteEnvironment {
            missing: environment.missing_fields(),
        });
    }
    let region = environment.region.as_deref().unwrap_or_default();
    let backend: Arc<dyn TrainingBackend> = Arc::new(HttpTrainingBackend::for_region(region));
    let location = environment
        .storage_location()
        .expect("complete environments have a storage location");
    let storage = storage::from_uri(&location, None).await?;
    Ok((backend, storage))
}

#[async_trait]
impl<T: Task> Executor for TrainingExecutor<T> {
    type Output = T::Output;

    fn name(&self) -> &str {
        &self.context.name
    }

    async fn stage(&mut self) -> Result<(), ExecutorError> {
        // The distributed descriptor ships alongside the task: the remote
        // bootstrap needs it before the task is loaded.
        if let Some(job) = &self.context.resource.distributed_job {
            self.context.staging.stage_distributed_job(job).await?;
        }
        self.context
            .staging
            .stage_task(Codec::default(), &self.task)
            .await
    }

    async fn start(&mut self) -> Result<String, ExecutorError> {
        let job = self.context.job(None);
        let payload = match job.payload()? {
            super::job::SubmissionPayload::Job(payload) => payload,
            super::job::SubmissionPayload::Tuning(_) => unreachable!("no tune attached"),
        };
        let handle = self
            .context
            .backend
            .create_job(&self.context.parent(), &payload)
            .await
            .map_err(ExecutorError::Backend)?;
        self.context.log_console_path(&handle);
        self.context.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn status(&self) -> Result<JobStatus, ExecutorError> {
        let handle = self.context.handle()?;
        let status = self
            .context
            .backend
            .get_job(handle)
            .await
            .map_err(ExecutorError::Backend)?;
        Ok(status.classify())
    }

    async fn result(&mut self) -> Result<Self::Output, ExecutorError> {
        self.context.staging.consume_output().await
    }
}

/// Runs a [`TunableTask`] as a hyperparameter study.
pub struct TuningExecutor<T: TunableTask> {
    task: T,
    tune: Tune,
    context: JobContext,
}

impl<T: TunableTask> TuningExecutor<T> {
    pub fn new(
        task: T,
        tune: Tune,
        resource: TrainingResource,
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
        web_console: bool,
        code_package: Option<String>,
        backend: Arc<dyn TrainingBackend>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, ExecutorError> {
        Ok(Self {
            task,
            tune,
            context: JobContext::new(
                resource,
                name.into(),
                labels,
                web_console,
                code_package,
                backend,
                storage,
            )?,
        })
    }

    /// Connects to the resource's regional endpoint and storage location.
    pub async fn connect(
        task: T,
        tune: Tune,
        resource: TrainingResource,
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
        web_console: bool,
        code_package: Option<String>,
    ) -> Result<Self, ExecutorError> {
        let (backend, storage) = connect_backend(&resource).await?;
        Self::new(
            task,
            tune,
            resource,
            name,
            labels,
            web_console,
            code_package,
            backend,
            storage,
        )
    }
}

#[async_trait]
impl<T: TunableTask> Executor for TuningExecutor<T> {
    type Output = TuneResult;

    fn name(&self) -> &str {
        &self.context.name
    }

    async fn stage(&mut self) -> Result<(), ExecutorError> {
        self.context
            .staging
            .stage_task(Codec::default(), &self.task)
            .await
    }

    async fn start(&mut self) -> Result<String, ExecutorError> {
        let job = self.context.job(Some(self.tune.clone()));
        let payload = match job.payload()? {
            super::job::SubmissionPayload::Tuning(payload) => payload,
            super::job::SubmissionPayload::Job(_) => unreachable!("tune attached"),
        };
        let handle = self
            .context
            .backend
            .create_tuning_job(&self.context.parent(), &payload)
            .await
            .map_err(ExecutorError::Backend)?;
        self.context.log_console_path(&handle);
        self.context.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn status(&self) -> Result<JobStatus, ExecutorError> {
        let handle = self.context.handle()?;
        let report = self
            .context
            .backend
            .get_tuning_job(handle)
            .await
            .map_err(ExecutorError::Backend)?;
        Ok(report.status.classify())
    }

    /// The study result is reduced from the service's trial reports, not
    /// read from an output artifact. The reduced result is persisted to the
    /// output path for consistency, then consumed like any other result.
    async fn result(&mut self) -> Result<Self::Output, ExecutorError> {
        let handle = self.context.handle()?;
        let report = self
            .context
            .backend
            .get_tuning_job(handle)
            .await
            .map_err(ExecutorError::Backend)?;
        let result =
            tune::reduce(self.tune.goal, report.trials).map_err(ExecutorError::Backend)?;
        self.context
            .staging
            .write_output(Codec::default(), &result)
            .await?;
        self.context.staging.consume_output().await
    }
}
