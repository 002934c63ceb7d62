//! Remote-side entry points.
//!
//! A job's container runs a small runner binary that links the caller's
//! task types and hands control to this module. The runner receives the
//! staging path, a distributed-mode flag, an optional first-party code
//! path, and (for tuning trials) trailing hyperparameter pairs:
//!
//! ```no_run
//! use clap::Parser;
//! use legate::bootstrap::{self, BootstrapArgs};
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct TrainModel;
//! # impl legate::task::Task for TrainModel {
//! #     type Output = f64;
//! #     fn run(&self) -> anyhow::Result<f64> { Ok(0.0) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BootstrapArgs::parse();
//!     bootstrap::execute::<TrainModel>(&args).await
//! }
//! ```
//!
//! [`execute`] dispatches on the staged artifacts: distributed jobs load
//! the shipped descriptor and let it drive startup; plain jobs run the
//! task and persist the output artifact. [`execute_trial`] runs one tuning
//! trial under the hyperparameters passed on the command line and reports
//! its metrics.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};

use crate::codec;
use crate::distributed::DistributedJob;
use crate::executor::{DISTRIBUTED_JOB_FILENAME, METRICS_FILENAME, TASK_FILENAME};
use crate::resource::ApiCredentials;
use crate::storage::{self, Storage};
use crate::task::{Hyperparameters, ParamValue, Task, TunableTask};

/// Installs the log subscriber for a runner binary. Remote containers have
/// no other logging setup; everything the bootstrap prints flows to the
/// backend's job logs.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Arguments the backends pass to the container entrypoint.
#[derive(Parser, Debug, Clone)]
#[command(name = "legate-runner", about = "Runs a staged legate task")]
pub struct BootstrapArgs {
    /// Staging path holding the job's artifacts.
    pub storage_path: String,
    /// Whether a distributed-job descriptor was staged alongside the task.
    #[arg(action = clap::ArgAction::Set)]
    pub distributed: bool,
    /// Storage path of first-party code, when the submitting side shipped
    /// any.
    #[arg(default_value = "")]
    pub code_package: String,
    /// Hyperparameter assignments for a tuning trial, in `--key value` or
    /// `--key=value` form.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub hyperparameters: Vec<String>,
}

async fn open_storage(storage_path: &str) -> Result<std::sync::Arc<dyn Storage>> {
    Ok(storage::from_uri(storage_path, ApiCredentials::from_env().as_ref()).await?)
}

async fn load_task<T: Task>(
    storage: &std::sync::Arc<dyn Storage>,
    storage_path: &str,
) -> Result<T> {
    let staged_path = storage::join(storage_path, TASK_FILENAME);
    let bytes = storage
        .read(&staged_path)
        .await
        .with_context(|| format!("no staged task at {staged_path}"))?;
    codec::load_staged(&bytes)
}

/// Runs a staged [`Task`]: the entrypoint for plain and distributed jobs.
pub async fn execute<T: Task>(args: &BootstrapArgs) -> Result<()> {
    if !args.hyperparameters.is_empty() {
        bail!(
            "received hyperparameters but this entrypoint runs plain tasks; \
             tuning jobs must use a runner built on execute_trial"
        );
    }
    if !args.code_package.is_empty() {
        // Compiled runners already contain their first-party code; the path
        // is part of the invocation contract, nothing more.
        info!(code_package = %args.code_package, "ignoring code package for a prebuilt runner");
    }

    let storage = open_storage(&args.storage_path).await?;
    let task: T = load_task(&storage, &args.storage_path).await?;

    if args.distributed {
        info!("starting execution of distributed job");
        let descriptor_path = storage::join(&args.storage_path, DISTRIBUTED_JOB_FILENAME);
        let bytes = storage
            .read(&descriptor_path)
            .await
            .with_context(|| format!("no distributed-job descriptor at {descriptor_path}"))?;
        let job: DistributedJob = codec::load_staged(&bytes)?;
        job.run(task, storage, &args.storage_path).await?;
        return Ok(());
    }

    info!("starting execution");
    let output = tokio::task::spawn_blocking(move || task.run()).await??;
    crate::distributed::persist_output(&storage, &args.storage_path, &output).await?;
    Ok(())
}

/// Runs one tuning trial of a [`TunableTask`] and reports its metrics.
pub async fn execute_trial<T: TunableTask>(args: &BootstrapArgs) -> Result<()> {
    let hyperparameters = parse_hyperparameters(&args.hyperparameters)?;
    info!(?hyperparameters, "starting trial execution");

    let storage = open_storage(&args.storage_path).await?;
    let staged_path = storage::join(&args.storage_path, TASK_FILENAME);
    let bytes = storage.read(&staged_path).await?;
    let task: T = codec::load_staged(&bytes)?;

    let metrics = tokio::task::spawn_blocking(move || task.run_trial(&hyperparameters))
        .await??;
    info!(?metrics, "reporting metrics to the tuning service");

    let metrics_path = storage::join(&args.storage_path, METRICS_FILENAME);
    let serialized = serde_json::to_vec(&metrics).map_err(|err| {
        error!("failed to serialize trial metrics; metric values must be plain numbers");
        anyhow::Error::from(err)
    })?;
    storage.write(&metrics_path, serialized.into()).await?;
    Ok(())
}

/// Entry point for each process of a process-group job; see
/// [`distributed::process_group`](crate::distributed::process_group).
pub async fn execute_process_group_target<T: Task>(
    input_path: &str,
    output_path: &str,
) -> Result<()> {
    let storage = open_storage(input_path).await?;
    crate::distributed::process_group::run_target::<T>(storage, input_path, output_path).await?;
    Ok(())
}

/// Parses trailing hyperparameter arguments, accepting both `--key value`
/// and `--key=value`.
pub fn parse_hyperparameters(raw: &[String]) -> Result<Hyperparameters> {
    let tokens: Vec<&str> = raw
        .iter()
        .flat_map(|arg| arg.splitn(2, '='))
        .collect();
    if tokens.len() % 2 != 0 {
        bail!("hyperparameters must come in key/value pairs, got {raw:?}");
    }
    Ok(tokens
        .chunks(2)
        .map(|pair| {
            (
                pair[0].trim_start_matches('-').to_string(),
                ParamValue::parse(pair[1]),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::codec::Codec;
    use crate::executor::OUTPUT_FILENAME;
    use crate::storage::memory::InMemoryStorage;
    use crate::task::TrialMetrics;

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

    impl TunableTask for Add {
        fn run_trial(&self, hyperparameters: &Hyperparameters) -> anyhow::Result<TrialMetrics> {
            let scale = match hyperparameters.get("scale") {
                Some(ParamValue::Int(scale)) => *scale,
                _ => 1,
            };
            let mut metrics = TrialMetrics::new();
            metrics.insert("sum".to_string(), ((self.a + self.b) * scale) as f64);
            Ok(metrics)
        }
    }

    #[test]
    fn parses_both_hyperparameter_syntaxes() {
        let raw = vec![
            "--learning_rate=0.1".to_string(),
            "--layers".to_string(),
            "4".to_string(),
            "--optimizer=adamw".to_string(),
        ];
        let parsed = parse_hyperparameters(&raw).unwrap();
        assert_eq!(
            parsed.get("learning_rate"),
            Some(&ParamValue::Float(0.1))
        );
        assert_eq!(parsed.get("layers"), Some(&ParamValue::Int(4)));
        assert_eq!(
            parsed.get("optimizer"),
            Some(&ParamValue::Text("adamw".to_string()))
        );
    }

    #[test]
    fn dangling_hyperparameters_are_rejected() {
        let raw = vec!["--learning_rate".to_string()];
        assert!(parse_hyperparameters(&raw).is_err());
    }

    async fn stage_task(storage: &Arc<InMemoryStorage>, path: &str, task: &Add) {
        let bytes = codec::stage(Codec::default(), task).unwrap();
        storage
            .write(&storage::join(path, TASK_FILENAME), bytes)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn executes_a_staged_task_and_persists_output() {
        let path = "mem://bootstrap-exec/run-1";
        let storage = InMemoryStorage::shared("bootstrap-exec");
        stage_task(&storage, path, &Add { a: 20, b: 22 }).await;

        let args = BootstrapArgs {
            storage_path: path.to_string(),
            distributed: false,
            code_package: String::new(),
            hyperparameters: Vec::new(),
        };
        execute::<Add>(&args).await.unwrap();

        let output = storage
            .read(&storage::join(path, OUTPUT_FILENAME))
            .await
            .unwrap();
        let value: i64 = codec::load_staged(&output).unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn trial_runs_report_metrics() {
        let path = "mem://bootstrap-trial/run-1";
        let storage = InMemoryStorage::shared("bootstrap-trial");
        stage_task(&storage, path, &Add { a: 1, b: 2 }).await;

        let args = BootstrapArgs {
            storage_path: path.to_string(),
            distributed: false,
            code_package: String::new(),
            hyperparameters: vec!["--scale".to_string(), "10".to_string()],
        };
        execute_trial::<Add>(&args).await.unwrap();

        let metrics = storage
            .read(&storage::join(path, METRICS_FILENAME))
            .await
            .unwrap();
        let metrics: TrialMetrics = serde_json::from_slice(&metrics).unwrap();
        assert_eq!(metrics.get("sum"), Some(&30.0));
    }

    #[test]
    fn argument_contract_parses_the_backend_invocation() {
        let args = BootstrapArgs::parse_from([
            "legate-runner",
            "gs://bucket/key-1",
            "true",
            "gs://bucket/key-1/code",
            "--epochs",
            "12",
        ]);
        assert_eq!(args.storage_path, "gs://bucket/key-1");
        assert!(args.distributed);
        assert_eq!(args.code_package, "gs://bucket/key-1/code");
        assert_eq!(args.hyperparameters, vec!["--epochs", "12"]);
    }
}
