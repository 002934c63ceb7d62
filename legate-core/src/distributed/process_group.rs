//! Process-group startup for tensor-training jobs.
//!
//! Every node launches the external process-group launcher with rendezvous
//! parameters derived from the cluster topology; the launcher fans out one
//! process per accelerator, each of which re-enters this module through
//! [`run_target`]. Rank 0 alone validates and persists the task's return
//! value.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::info;

use super::{persist_output, ClusterTopology, DistributedError, RANK_VAR};
use crate::codec;
use crate::executor::{OUTPUT_FILENAME, TASK_FILENAME};
use crate::storage::{self, Storage};
use crate::task::Task;

/// Rendezvous port. Hardcoded for proxy compatibility on the training
/// service.
pub const RENDEZVOUS_PORT: u16 = 3333;
/// Rendezvous id shared by all nodes of one job.
const RENDEZVOUS_ID: &str = "legate";
/// Rendezvous backend expected by the launcher.
const RENDEZVOUS_BACKEND: &str = "c10d";

/// The key a process-group task's returned mapping must contain.
pub const STATE_KEY: &str = "model_state";

fn default_launcher() -> String {
    "torchrun".to_string()
}

fn default_target() -> Vec<String> {
    vec![
        "legate-runner".to_string(),
        "process-group-target".to_string(),
    ]
}

/// Configuration for a distributed tensor-training job.
///
/// `launcher` is the external elastic launcher; `target` is the command it
/// runs once per local process, which must re-enter [`run_target`] with the
/// input and output paths appended by [`launcher_args`](Self::launcher_args).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ProcessGroupJob {
    pub launcher: String,
    pub target: Vec<String>,
}

impl Default for ProcessGroupJob {
    fn default() -> Self {
        Self {
            launcher: default_launcher(),
            target: default_target(),
        }
    }
}

impl ProcessGroupJob {
    /// Builds the launcher invocation for this node.
    ///
    /// With worker pools present, rendezvous runs against the coordinator's
    /// host on the hardcoded port and only rank 0 hosts it; a single-node
    /// job runs standalone.
    pub fn launcher_args(
        &self,
        topology: Option<&ClusterTopology>,
        storage_path: &str,
        rank: &str,
    ) -> Result<Vec<String>, DistributedError> {
        let input_path = storage::join(storage_path, TASK_FILENAME);
        let output_path = storage::join(storage_path, OUTPUT_FILENAME);

        let mut args = Vec::new();
        match topology {
            Some(topology) if topology.has_workers() => {
                let (coordinator_host, _) = topology
                    .coordinator_address()?
                    .split_once(':')
                    .ok_or(DistributedError::MissingCoordinator)?;
                let is_host = rank == "0";
                args.push("--nproc_per_node=auto".to_string());
                args.push(format!("--rdzv_id={RENDEZVOUS_ID}"));
                args.push(format!("--rdzv_backend={RENDEZVOUS_BACKEND}"));
                args.push(format!(
                    "--rdzv_endpoint={coordinator_host}:{RENDEZVOUS_PORT}"
                ));
                args.push(format!("--rdzv_conf=is_host={is_host}"));
                args.push(format!("--nnodes={}", topology.node_count()));
            }
            _ => {
                args.push("--standalone".to_string());
                args.push("--nproc_per_node=auto".to_string());
            }
        }
        args.extend(self.target.iter().cloned());
        args.push(input_path);
        args.push(output_path);
        Ok(args)
    }

    /// Launches the process group on this node and waits for it to finish.
    ///
    /// There is no coordinator/worker branch here: every node runs the
    /// launcher, and the launcher handles fan-out and rendezvous.
    pub async fn run(&self, storage_path: &str) -> Result<(), DistributedError> {
        let topology = ClusterTopology::from_env()?;
        let rank = std::env::var(RANK_VAR).unwrap_or_else(|_| "0".to_string());
        let args = self.launcher_args(topology.as_ref(), storage_path, &rank)?;

        info!(launcher = %self.launcher, ?args, "launching process group");
        let status = Command::new(&self.launcher).args(&args).status().await?;
        if !status.success() {
            return Err(DistributedError::ProcessFailed {
                command: self.launcher.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

/// Entry point for each process spawned by the launcher.
///
/// Loads the staged task, publishes the rendezvous address for the external
/// process-group library, runs the task, and (from rank 0 only) validates
/// that the returned value is a mapping containing [`STATE_KEY`] before
/// persisting it. State values must already be host-resident: anything that
/// cannot be serialized portably fails here, not downstream.
pub async fn run_target<T: Task>(
    storage: Arc<dyn Storage>,
    input_path: &str,
    output_path: &str,
) -> Result<(), DistributedError> {
    let staged = storage.read(input_path).await?;
    let task: T = codec::load_staged(&staged).map_err(DistributedError::Codec)?;

    if let Some(topology) = ClusterTopology::from_env()? {
        let (host, _) = topology
            .coordinator_address()?
            .split_once(':')
            .ok_or(DistributedError::MissingCoordinator)?;
        std::env::set_var("MASTER_ADDR", host);
        std::env::set_var("MASTER_PORT", RENDEZVOUS_PORT.to_string());
    }

    let output = super::run_task(task).await?;
    validate_snapshot(&output)?;

    let rank = std::env::var(RANK_VAR).unwrap_or_else(|_| "0".to_string());
    if rank == "0" {
        let storage_path = input_path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or(input_path);
        debug_assert!(output_path.starts_with(storage_path));
        persist_output(&storage, storage_path, &output).await?;
    }
    Ok(())
}

/// Checks that the task returned a mapping carrying the required state
/// entry.
fn validate_snapshot<O: Serialize>(output: &O) -> Result<(), DistributedError> {
    let value = serde_json::to_value(output)
        .map_err(|err| DistributedError::Codec(err.into()))?;
    match value.as_object() {
        Some(map) if map.contains_key(STATE_KEY) => Ok(()),
        _ => Err(DistributedError::InvalidReturnShape { key: STATE_KEY }),
    }
}
