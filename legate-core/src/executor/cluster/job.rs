//! Data model for runs submitted to the cluster service.

use serde::Serialize;
use uuid::Uuid;

use crate::resource::{ClusterResource, WorkerCount};

/// Packages installed on every provisioned cluster: the runner binary that
/// loads the staged task, and the orchestration-context library.
pub const REQUIRED_LIBRARIES: [&str; 2] = ["legate-runner", "legate-context"];

/// A description of one run on the cluster service, derived from a
/// [`ClusterResource`] plus the staged-task location. Created fresh per
/// submission and not persisted beyond it.
#[derive(Debug, Clone)]
pub struct ClusterJob {
    /// Backend-safe display name.
    pub name: String,
    pub resource: ClusterResource,
    /// Full path to the staging directory (includes the storage key).
    pub storage_path: String,
    pub storage_key: String,
    /// Path to the uploaded bootstrap script.
    pub run_path: String,
    /// Resolved from the policy name through the backend.
    pub cluster_policy_id: String,
    /// Cache key deduplicating accidental double submissions.
    pub idempotency_token: String,
}

/// The run-submission payload.
#[derive(Serialize, Debug, Clone)]
pub struct RunSubmission {
    pub tasks: Vec<TaskSpec>,
    pub run_name: String,
    pub timeout_seconds: u64,
    pub idempotency_token: String,
    pub access_control_list: Vec<AccessControl>,
}

#[derive(Serialize, Debug, Clone)]
pub struct TaskSpec {
    pub task_key: String,
    pub description: String,
    pub depends_on: Vec<String>,
    pub script_task: ScriptTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_cluster_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_cluster: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub libraries: Vec<LibrarySpec>,
}

/// The bootstrap invocation: the uploaded script plus its positional
/// parameters (storage path, storage key).
#[derive(Serialize, Debug, Clone)]
pub struct ScriptTask {
    pub script_file: String,
    pub parameters: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct LibrarySpec {
    pub package: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct AccessControl {
    pub group_name: String,
    pub permission_level: String,
}

#[derive(Serialize)]
struct ClusterSpec<'a> {
    runtime_version: &'a str,
    node_type_id: &'a str,
    policy_id: &'a str,
    data_security_mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_workers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    autoscale: Option<Autoscale>,
}

#[derive(Serialize)]
struct Autoscale {
    min_workers: u32,
    max_workers: u32,
}

impl ClusterJob {
    pub fn new(
        name: impl Into<String>,
        resource: ClusterResource,
        storage_path: impl Into<String>,
        storage_key: impl Into<String>,
        run_path: impl Into<String>,
        cluster_policy_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            resource,
            storage_path: storage_path.into(),
            storage_key: storage_key.into(),
            run_path: run_path.into(),
            cluster_policy_id: cluster_policy_id.into(),
            idempotency_token: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Builds the payload for the run-submission API.
    pub fn payload(&self) -> RunSubmission {
        RunSubmission {
            tasks: vec![self.task_spec()],
            run_name: self.name.clone(),
            timeout_seconds: self.resource.timeout_seconds,
            idempotency_token: self.idempotency_token.clone(),
            access_control_list: vec![AccessControl {
                group_name: self.resource.group().to_string(),
                permission_level: "CAN_MANAGE".to_string(),
            }],
        }
    }

    fn task_spec(&self) -> TaskSpec {
        let libraries = if self.resource.existing_cluster_id.is_none() {
            self.libraries()
        } else {
            Vec::new()
        };
        TaskSpec {
            task_key: task_key(&self.name),
            description: "A task submitted from legate".to_string(),
            depends_on: Vec::new(),
            script_task: ScriptTask {
                script_file: self.run_path.clone(),
                parameters: vec![self.storage_path.clone(), self.storage_key.clone()],
            },
            existing_cluster_id: self.resource.existing_cluster_id.clone(),
            new_cluster: self.cluster_spec(),
            libraries,
        }
    }

    /// The user's packages plus the two the bootstrap always needs.
    /// Version-pinned entries are passed through untouched.
    fn libraries(&self) -> Vec<LibrarySpec> {
        let mut packages = self.resource.libraries.clone();
        for required in REQUIRED_LIBRARIES {
            let present = packages
                .iter()
                .any(|p| p.split("==").next() == Some(required));
            if !present {
                packages.push(required.to_string());
            }
        }
        packages
            .into_iter()
            .map(|package| LibrarySpec { package })
            .collect()
    }

    /// The cluster to provision, or `None` when reusing an existing one.
    /// User overrides are merged on top of the generated spec, winning on
    /// conflict.
    fn cluster_spec(&self) -> Option<serde_json::Value> {
        if self.resource.existing_cluster_id.is_some() {
            return None;
        }
        let (num_workers, autoscale) = match self.resource.worker_count {
            WorkerCount::Fixed(count) => (Some(count), None),
            WorkerCount::Autoscale {
                min_workers,
                max_workers,
            } => (
                None,
                Some(Autoscale {
                    min_workers,
                    max_workers,
                }),
            ),
        };
        let spec = ClusterSpec {
            runtime_version: &self.resource.runtime_version,
            node_type_id: &self.resource.machine,
            policy_id: &self.cluster_policy_id,
            data_security_mode: &self.resource.data_security_mode,
            num_workers,
            autoscale,
        };
        let mut value = serde_json::to_value(spec).expect("cluster spec serializes");
        if let (Some(object), Some(serde_json::Value::Object(overrides))) = (
            value.as_object_mut(),
            self.resource.cluster_spec_overrides.clone(),
        ) {
            for (key, val) in overrides {
                object.insert(key, val);
            }
        }
        Some(value)
    }
}

/// Bounded task key: the head and tail of the (already backend-safe) name.
fn task_key(name: &str) -> String {
    let head: String = name.chars().take(32).collect();
    let tail: String = {
        let chars: Vec<char> = name.chars().collect();
        chars[chars.len().saturating_sub(32)..].iter().collect()
    };
    format!("{head}---{tail}")
}
