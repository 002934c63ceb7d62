//! In-process execution behind the executor interface.
//!
//! The local executor exists to give callers a uniform interface whether or
//! not remote execution is actually desired: no resource configured means
//! the task runs here, with no network access at all. It still plays both
//! sides of the staging protocol (the task is serialized to the staging
//! directory, loaded back, and executed), so a locally-tested task exercises
//! the exact envelope a remote backend would see.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Executor, ExecutorError, JobStatus, StagingArea};
use crate::codec::{self, Codec};
use crate::storage::{local::LocalStorage, Storage};
use crate::task::Task;

/// Runs tasks in the submitting process.
pub struct LocalExecutor<T: Task> {
    task: T,
    name: String,
    staging: StagingArea,
    finished: bool,
}

impl<T: Task> LocalExecutor<T> {
    /// Creates an executor staging under the user's temporary directory.
    pub fn new(task: T, name: impl Into<String>) -> Self {
        let root = std::env::temp_dir().join("legate-storage");
        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new());
        Self::with_storage(task, name, storage, root.to_string_lossy().into_owned())
    }

    /// Creates an executor over explicit storage. Used by tests and
    /// emulation.
    pub fn with_storage(
        task: T,
        name: impl Into<String>,
        storage: Arc<dyn Storage>,
        root: impl Into<String>,
    ) -> Self {
        Self {
            task,
            name: name.into(),
            staging: StagingArea::new(storage, root),
            finished: false,
        }
    }
}

#[async_trait]
impl<T: Task> Executor for LocalExecutor<T> {
    type Output = T::Output;

    fn name(&self) -> &str {
        &self.name
    }

    async fn stage(&mut self) -> Result<(), ExecutorError> {
        self.staging.stage_task(Codec::default(), &self.task).await
    }

    async fn start(&mut self) -> Result<String, ExecutorError> {
        debug!(name = %self.name, path = %self.staging.path(), "running task in-process");
        let staged = self.staging.storage().read(&self.staging.task_path()).await?;
        let task: T = codec::load_staged(&staged).map_err(ExecutorError::Codec)?;

        let output = tokio::task::spawn_blocking(move || task.run())
            .await
            .map_err(|err| ExecutorError::Backend(err.into()))?
            .map_err(|err| ExecutorError::Failed {
                name: self.name.clone(),
                message: format!("{err:#}"),
            })?;

        self.staging.write_output(Codec::default(), &output).await?;
        self.finished = true;
        Ok(format!("local/{}", self.staging.key()))
    }

    async fn status(&self) -> Result<JobStatus, ExecutorError> {
        Ok(if self.finished {
            JobStatus::Succeeded
        } else {
            JobStatus::Executing
        })
    }

    async fn result(&mut self) -> Result<Self::Output, ExecutorError> {
        self.staging.consume_output().await
    }
}
