//! The remote-call entry point.
//!
//! [`Remote`] binds a task to a resource descriptor and drives the matching
//! executor's lifecycle, so invoking a task remotely reads like invoking it
//! locally:
//!
//! ```
//! use legate::{remote::Remote, task::Task};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Add {
//!     a: i64,
//!     b: i64,
//! }
//!
//! impl Task for Add {
//!     type Output = i64;
//!
//!     fn run(&self) -> anyhow::Result<i64> {
//!         Ok(self.a + self.b)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // No resource configured: the task runs in-process.
//!     let sum = Remote::new(Add { a: 1, b: 2 }).run().await?;
//!     assert_eq!(sum, 3);
//!     Ok(())
//! }
//! ```
//!
//! With a resource attached, explicitly or from `legate.yaml`, the same
//! call stages the task to remote storage, submits a backend job, polls it
//! to completion, and returns the deserialized result. Executor selection
//! is a pure match on the resource variant.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

use crate::codec::Payload;
use crate::common::safe_label;
use crate::config;
use crate::context::{self, ContextProvider};
use crate::executor::cluster::ClusterExecutor;
use crate::executor::local::LocalExecutor;
use crate::executor::training::{Tune, TuneResult, TrainingExecutor, TuningExecutor};
use crate::executor::{Executor, ExecutorError};
use crate::resource::{Resource, TrainingResource};
use crate::task::{Task, TunableTask};

/// A task bound to a resource and ready to run remotely.
pub struct Remote<T> {
    task: T,
    resource: Option<Resource>,
    job_name: Option<String>,
    web_console: bool,
    code_package: Option<String>,
    providers: Option<Vec<Box<dyn ContextProvider>>>,
}

impl<T: Payload> Remote<T> {
    pub fn new(task: T) -> Self {
        Self {
            task,
            resource: None,
            job_name: None,
            web_console: false,
            code_package: None,
            providers: None,
        }
    }

    /// The resource to run on. Without one (and without a configuration
    /// file entry for the job name) the task runs locally.
    pub fn resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Display name for the job; also the key looked up in the
    /// configuration file.
    pub fn job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    /// Allow web-console access to the remote job (training service only).
    pub fn web_console(mut self, enabled: bool) -> Self {
        self.web_console = enabled;
        self
    }

    /// Storage path of first-party code for the remote bootstrap to fetch.
    pub fn code_package(mut self, path: impl Into<String>) -> Self {
        self.code_package = Some(path.into());
        self
    }

    /// Replaces the ambient context-provider chain. Used by tests and
    /// callers with bespoke environments.
    pub fn context_providers(mut self, providers: Vec<Box<dyn ContextProvider>>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// The attached resource, or the configuration-file entry for the job
    /// name.
    fn select_resource(&mut self) -> Result<Option<Resource>, ExecutorError> {
        if let Some(resource) = self.resource.take() {
            return Ok(Some(resource));
        }
        let Some(name) = &self.job_name else {
            return Ok(None);
        };
        let mut configured = config::find_default_configuration(Path::new("."))?;
        Ok(configured
            .as_mut()
            .and_then(|resources| resources.remove(name)))
    }

    /// Resolves the training environment from ambient context and collects
    /// context tags as job labels.
    async fn resolve_training(
        &mut self,
        mut resource: TrainingResource,
    ) -> (TrainingResource, BTreeMap<String, String>) {
        let environment = resource.environment.clone().unwrap_or_default();
        if self.providers.is_none() {
            self.providers = Some(context::default_providers());
        }
        let providers = self.providers.as_deref().expect("providers just installed");
        let (environment, mut labels) =
            context::resolve_environment(&environment, providers).await;
        labels.insert(
            "legate-version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        resource.environment = Some(environment);
        (resource, labels)
    }
}

/// Short display name derived from the task's type.
fn default_name<T>() -> String {
    let type_name = std::any::type_name::<T>();
    let short = type_name.rsplit("::").next().unwrap_or(type_name);
    format!("{}-legate", safe_label(short))
}

impl<T: Task> Remote<T> {
    /// Runs the task on the bound resource and returns its output.
    pub async fn run(mut self) -> Result<T::Output, ExecutorError> {
        let name = self
            .job_name
            .clone()
            .unwrap_or_else(|| default_name::<T>());
        match self.select_resource()? {
            None | Some(Resource::Local) => {
                info!("executing task locally");
                LocalExecutor::new(self.task, name).run().await
            }
            Some(Resource::Cluster(resource)) => {
                info!("executing task on the cluster service");
                ClusterExecutor::connect(self.task, resource, name)
                    .await?
                    .run()
                    .await
            }
            Some(Resource::Training(resource)) => {
                info!("executing task on the training service");
                let (resource, labels) = self.resolve_training(resource).await;
                TrainingExecutor::connect(
                    self.task,
                    resource,
                    name,
                    labels,
                    self.web_console,
                    self.code_package,
                )
                .await?
                .run()
                .await
            }
        }
    }
}

impl<T: TunableTask> Remote<T> {
    /// Runs the task as a hyperparameter study on the training service and
    /// returns the reduced study result.
    pub async fn run_tuning(mut self, tune: Tune) -> Result<TuneResult, ExecutorError> {
        let name = self
            .job_name
            .clone()
            .unwrap_or_else(|| format!("{}-tuning", default_name::<T>()));
        match self.select_resource()? {
            Some(Resource::Training(resource)) => {
                let (resource, labels) = self.resolve_training(resource).await;
                TuningExecutor::connect(
                    self.task,
                    tune,
                    resource,
                    name,
                    labels,
                    self.web_console,
                    self.code_package,
                )
                .await?
                .run()
                .await
            }
            _ => Err(ExecutorError::Backend(anyhow::anyhow!(
                "hyperparameter tuning requires a training-service resource"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    impl Task for Add {
        type Output = i64;

        fn run(&self) -> anyhow::Result<i64> {
            Ok(self.a + self.b)
        }
    }

    #[tokio::test]
    async fn runs_locally_when_no_resource_is_configured() {
        // End to end, no network: decorate, call, get the sum back.
        let sum = Remote::new(Add { a: 1, b: 2 }).run().await.unwrap();
        assert_eq!(sum, 3);
    }

    #[tokio::test]
    async fn explicit_local_resources_run_locally_too() {
        let sum = Remote::new(Add { a: 2, b: 3 })
            .resource(Resource::Local)
            .job_name("sum")
            .run()
            .await
            .unwrap();
        assert_eq!(sum, 5);
    }

    #[test]
    fn default_names_are_backend_safe() {
        assert_eq!(default_name::<Add>(), "add-legate");
    }
}
