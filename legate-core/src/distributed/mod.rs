//! Multi-node startup protocol.
//!
//! When a job spans more than one node, the managed training service starts
//! the same container on every replica and injects a cluster-topology JSON
//! document into the environment. The [`DistributedJob`] descriptor,
//! serialized and shipped alongside the staged task, tells each node what
//! to do with its role before and after invoking the task.
//!
//! Three startup strategies are supported:
//! - [`MultiNodeJob`]: no extra setup; the coordinator persists output,
//!   workers run without persisting.
//! - [`SchedulerJob`](scheduler::SchedulerJob): the coordinator starts a
//!   scheduler process and publishes its address for workers to join.
//! - [`ProcessGroupJob`](process_group::ProcessGroupJob): every node joins a
//!   process group through an external launcher; only rank 0 persists.
//!
//! The descriptor is a closed, serializable union: whatever startup behavior
//! ships to the remote side has to be a wire type, not an open class
//! hierarchy.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::codec::{self, Codec};
use crate::executor::OUTPUT_FILENAME;
use crate::storage::{self, Storage, StorageError};
use crate::task::Task;

pub mod process_group;
pub mod scheduler;

/// Environment variable holding the cluster-topology JSON document.
pub const CLUSTER_TOPOLOGY_VAR: &str = "CLUSTER_SPEC";
/// Environment variable holding this node's rank.
pub const RANK_VAR: &str = "RANK";
/// Environment variable holding this process's rank within the node.
pub const LOCAL_RANK_VAR: &str = "LOCAL_RANK";

/// Pool names in the topology are `workerpool<N>`; pool 0 is the
/// coordinator.
const POOL_PREFIX: &str = "workerpool";

/// File the scheduler coordinator publishes its address through.
pub const COORDINATOR_ADDR_FILENAME: &str = "coordinator.addr";

/// Failures of the distributed startup protocol. These are fatal: the
/// bootstrap is never retried.
#[derive(Debug, Error)]
pub enum DistributedError {
    #[error("cluster topology in {CLUSTER_TOPOLOGY_VAR} cannot be parsed: {0}")]
    MalformedTopology(#[source] serde_json::Error),
    #[error("unrecognized pool name {0:?} in cluster topology")]
    UnknownPool(String),
    #[error("cluster topology names no {POOL_PREFIX}0 coordinator pool")]
    MissingCoordinator,
    #[error("{0} missing or invalid in the environment")]
    MissingRank(&'static str),
    #[error("timed out waiting for the coordinator address at {path}")]
    CoordinatorTimeout { path: String },
    #[error("{command} exited unsuccessfully: {status}")]
    ProcessFailed { command: String, status: String },
    #[error("task failed: {0:#}")]
    Task(#[source] anyhow::Error),
    #[error(
        "process-group tasks must return a mapping containing the {key:?} entry"
    )]
    InvalidReturnShape { key: &'static str },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to encode or decode a staged payload: {0}")]
    Codec(#[source] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The cluster-topology document injected by the training service: pool
/// names mapped to the network addresses of their replicas, plus this
/// node's own assignment.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterTopology {
    pub cluster: BTreeMap<String, Vec<String>>,
    pub task: TopologyTask,
}

/// This node's assignment within the topology.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TopologyTask {
    #[serde(rename = "type")]
    pub pool: String,
    #[serde(default)]
    pub index: u32,
}

impl ClusterTopology {
    /// Parses a topology document. Malformed JSON is a configuration error,
    /// never silently ignored.
    pub fn parse(raw: &str) -> Result<Self, DistributedError> {
        serde_json::from_str(raw).map_err(DistributedError::MalformedTopology)
    }

    /// Reads the topology from the environment. Absence means single-node
    /// execution and yields `None` with a warning.
    pub fn from_env() -> Result<Option<Self>, DistributedError> {
        match std::env::var(CLUSTER_TOPOLOGY_VAR) {
            Ok(raw) => Ok(Some(Self::parse(&raw)?)),
            Err(_) => {
                warn!(
                    "{CLUSTER_TOPOLOGY_VAR} not found in environment; assuming \
                     single-node execution"
                );
                Ok(None)
            }
        }
    }

    /// The `host:port` address of the coordinator pool's single replica.
    pub fn coordinator_address(&self) -> Result<&str, DistributedError> {
        self.cluster
            .get(&format!("{POOL_PREFIX}0"))
            .and_then(|hosts| hosts.first())
            .map(String::as_str)
            .ok_or(DistributedError::MissingCoordinator)
    }

    /// Whether any pool beyond the coordinator exists.
    pub fn has_workers(&self) -> bool {
        self.cluster.contains_key(&format!("{POOL_PREFIX}1"))
    }

    /// Total node count: the coordinator plus the first worker pool.
    pub fn node_count(&self) -> usize {
        1 + self
            .cluster
            .get(&format!("{POOL_PREFIX}1"))
            .map_or(0, Vec::len)
    }

    /// This node's pool number: 0 for the coordinator, positive for worker
    /// pools.
    pub fn pool_number(&self) -> Result<u32, DistributedError> {
        self.task
            .pool
            .strip_prefix(POOL_PREFIX)
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| DistributedError::UnknownPool(self.task.pool.clone()))
    }
}

/// This node's pool number from the environment, or `None` outside a
/// multi-node cluster.
pub fn pool_number() -> Result<Option<u32>, DistributedError> {
    match ClusterTopology::from_env()? {
        Some(topology) => Ok(Some(topology.pool_number()?)),
        None => Ok(None),
    }
}

/// The startup protocol shipped alongside a staged task.
///
/// Externally tagged: the descriptor crosses the wire through the
/// non-self-describing codec, which cannot buffer an internal tag.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub enum DistributedJob {
    MultiNode(MultiNodeJob),
    Scheduler(scheduler::SchedulerJob),
    ProcessGroup(process_group::ProcessGroupJob),
}

impl DistributedJob {
    /// Entry point invoked once per node by the remote bootstrap.
    pub async fn run<T: Task>(
        &self,
        task: T,
        storage: Arc<dyn Storage>,
        storage_path: &str,
    ) -> Result<(), DistributedError> {
        match self {
            Self::MultiNode(job) => job.run(task, storage, storage_path).await,
            Self::Scheduler(job) => job.run(task, storage, storage_path).await,
            Self::ProcessGroup(job) => job.run(storage_path).await,
        }
    }
}

/// A multi-node job with no startup code beyond what the training service
/// itself provides.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MultiNodeJob {}

impl MultiNodeJob {
    pub async fn run<T: Task>(
        &self,
        task: T,
        storage: Arc<dyn Storage>,
        storage_path: &str,
    ) -> Result<(), DistributedError> {
        match pool_number()? {
            Some(0) | None => {
                let output = run_task(task).await?;
                persist_output(&storage, storage_path, &output).await
            }
            Some(pool) => {
                info!(pool, "running task on worker without persisting output");
                run_task(task).await.map(drop)
            }
        }
    }
}

/// Runs the task body off the async runtime's worker threads.
pub(crate) async fn run_task<T: Task>(task: T) -> Result<T::Output, DistributedError> {
    info!("starting user task execution");
    tokio::task::spawn_blocking(move || task.run())
        .await
        .map_err(|err| DistributedError::Task(err.into()))?
        .map_err(DistributedError::Task)
}

/// Writes the output artifact for the submitting process to collect.
///
/// Serialization failures are logged with a portability hint before being
/// surfaced: returning framework-resident objects (device tensors, session
/// handles) from a task is the common cause.
pub(crate) async fn persist_output<O: Serialize>(
    storage: &Arc<dyn Storage>,
    storage_path: &str,
    output: &O,
) -> Result<(), DistributedError> {
    let output_path = storage::join(storage_path, OUTPUT_FILENAME);
    info!(path = %output_path, "saving task output");
    let bytes = codec::stage(Codec::default(), output).map_err(|err| {
        tracing::error!(
            "failed to serialize the task's return value; convert framework \
             objects to portable representations before returning"
        );
        DistributedError::Codec(err)
    })?;
    storage.write(&output_path, bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(json: &str) -> ClusterTopology {
        ClusterTopology::parse(json).unwrap()
    }

    #[test]
    fn pool_numbers_follow_the_task_assignment() {
        let chief = topology(
            r#"{"cluster": {"workerpool0": ["10.0.0.2:2222"]},
                "task": {"type": "workerpool0", "index": 0}}"#,
        );
        assert_eq!(chief.pool_number().unwrap(), 0);

        let worker = topology(
            r#"{"cluster": {"workerpool0": ["10.0.0.2:2222"],
                            "workerpool1": ["10.0.0.3:2222", "10.0.0.4:2222"]},
                "task": {"type": "workerpool1", "index": 1}}"#,
        );
        assert_eq!(worker.pool_number().unwrap(), 1);
        assert!(worker.has_workers());
        assert_eq!(worker.node_count(), 3);
    }

    #[test]
    fn malformed_topology_is_fatal() {
        assert!(matches!(
            ClusterTopology::parse("{not json"),
            Err(DistributedError::MalformedTopology(_))
        ));
    }

    #[test]
    fn unknown_pool_names_are_rejected() {
        let t = topology(
            r#"{"cluster": {"workerpool0": ["10.0.0.2:2222"]},
                "task": {"type": "evaluator", "index": 0}}"#,
        );
        assert!(matches!(
            t.pool_number(),
            Err(DistributedError::UnknownPool(_))
        ));
    }

    #[test]
    fn coordinator_address_comes_from_pool_zero() {
        let t = topology(
            r#"{"cluster": {"workerpool0": ["10.0.0.2:2222"]},
                "task": {"type": "workerpool0", "index": 0}}"#,
        );
        assert_eq!(t.coordinator_address().unwrap(), "10.0.0.2:2222");
    }
}
