//! Resource descriptors.
//!
//! A [`Resource`] describes where a task should run and what shape the
//! compute should take. It is a closed union over the supported backend
//! kinds; the [`Remote`](crate::remote::Remote) entry point selects the
//! matching [`Executor`](crate::executor::Executor) purely by matching on
//! the variant.
//!
//! Descriptors are plain data: they are constructed by the caller or parsed
//! from the configuration file (see [`config`](crate::config)) and are not
//! mutated once handed to an executor. Ambient-environment resolution
//! happens on an owned copy before the executor is built.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::distributed::DistributedJob;

/// Environment variable naming the cluster backend host.
pub const CLUSTER_HOST_VAR: &str = "LEGATE_CLUSTER_HOST";
/// Environment variable naming the cluster backend API token.
pub const CLUSTER_TOKEN_VAR: &str = "LEGATE_CLUSTER_TOKEN";

/// Registry prefixed onto bare image tags when expanding
/// [`EnvironmentConfig::image`].
const DEFAULT_IMAGE_REGISTRY: &str = "us.gcr.io";

/// Validation failures raised when a descriptor cannot describe a runnable
/// job.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("coordinator pool must have exactly one replica, got {0}")]
    CoordinatorReplicas(u32),
    #[error("cluster credentials not found; set them on the resource or via {CLUSTER_HOST_VAR} and {CLUSTER_TOKEN_VAR}")]
    MissingCredentials,
    #[error("persistent_resource_id is required to manage a resource pool")]
    MissingPoolId,
}

/// The supported backend kinds.
///
/// One executor exists per variant; there is no duck-typed fallback. A
/// missing resource means local execution.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    /// Run in the submitting process.
    Local,
    /// Run as a job on the managed data-engineering cluster service.
    Cluster(ClusterResource),
    /// Run as a job on the managed training service.
    Training(TrainingResource),
}

impl Resource {
    /// Validates the descriptor before it is handed to an executor.
    pub fn validate(&self) -> Result<(), ResourceError> {
        match self {
            Self::Local => Ok(()),
            Self::Cluster(_) => Ok(()),
            Self::Training(resource) => resource.validate(),
        }
    }
}

/// Credentials for an HTTP backend: host plus bearer token.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiCredentials {
    pub host: String,
    pub token: String,
}

impl ApiCredentials {
    /// Reads cluster credentials from the conventional environment
    /// variables.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var(CLUSTER_HOST_VAR).ok()?;
        let token = std::env::var(CLUSTER_TOKEN_VAR).ok()?;
        Some(Self { host, token })
    }
}

/// Description of a GPU accelerator attached to a machine pool. The
/// accelerator kind and count must be compatible with the machine type.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorConfig {
    #[serde(default = "default_accelerator_count")]
    pub count: u32,
    #[serde(default = "default_accelerator_kind")]
    pub kind: String,
}

fn default_accelerator_count() -> u32 {
    1
}

fn default_accelerator_kind() -> String {
    "NVIDIA_TESLA_T4".to_string()
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            count: default_accelerator_count(),
            kind: default_accelerator_kind(),
        }
    }
}

/// An NFS share mounted into every replica of a machine pool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NfsMount {
    pub server: String,
    pub path: String,
    pub mount_point: String,
}

/// Shape of one machine pool on the training service.
///
/// The autoscaling bounds are only meaningful when the pool backs a
/// long-lived persistent resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MachineConfig {
    pub kind: String,
    pub count: u32,
    pub min_replica_count: Option<u32>,
    pub max_replica_count: Option<u32>,
    pub accelerator: Option<AcceleratorConfig>,
    pub disk_size_gb: Option<u32>,
    pub nfs_mounts: Vec<NfsMount>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            kind: "n2-standard-4".to_string(),
            count: 1,
            min_replica_count: None,
            max_replica_count: None,
            accelerator: None,
            disk_size_gb: None,
            nfs_mounts: Vec::new(),
        }
    }
}

/// The environment a training-service job runs in.
///
/// All fields may be omitted and resolved from ambient context at call time;
/// [`is_complete`](Self::is_complete) reports whether enough is known to
/// submit a job. The network is deliberately not required.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub project: Option<String>,
    pub storage_location: Option<String>,
    pub service_account: Option<String>,
    pub region: Option<String>,
    pub network: Option<String>,
    pub image: Option<String>,
}

impl EnvironmentConfig {
    /// Whether every field required for submission is present.
    pub fn is_complete(&self) -> bool {
        self.project.is_some()
            && self.service_account.is_some()
            && self.region.is_some()
            && self.image.is_some()
    }

    /// Names the fields still missing, for error messages.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.project.is_none() {
            missing.push("project");
        }
        if self.service_account.is_none() {
            missing.push("service_account");
        }
        if self.region.is_none() {
            missing.push("region");
        }
        if self.image.is_none() {
            missing.push("image");
        }
        missing
    }

    /// The staging root for this environment, defaulting to a per-project
    /// bucket when not set explicitly.
    pub fn storage_location(&self) -> Option<String> {
        if let Some(location) = &self.storage_location {
            return Some(location.clone());
        }
        self.project
            .as_ref()
            .map(|project| format!("gs://legate-{project}/"))
    }

    /// The fully qualified container image. A bare tag is expanded against
    /// the project's registry path.
    pub fn resolved_image(&self) -> Option<String> {
        let image = self.image.as_ref()?;
        if image.contains('/') {
            return Some(image.clone());
        }
        let project = self.project.as_ref()?;
        Some(format!("{DEFAULT_IMAGE_REGISTRY}/{project}/{image}"))
    }
}

/// Description of a training-service compute resource: one coordinator pool,
/// optional worker pools, and the environment to run in.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct TrainingResource {
    pub coordinator: MachineConfig,
    pub workers: Option<MachineConfig>,
    pub environment: Option<EnvironmentConfig>,
    pub distributed_job: Option<DistributedJob>,
    pub persistent_resource_id: Option<String>,
}

impl TrainingResource {
    /// Enforces the cluster-shape invariant: the coordinator pool always has
    /// exactly one replica.
    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.coordinator.count != 1 {
            return Err(ResourceError::CoordinatorReplicas(self.coordinator.count));
        }
        Ok(())
    }
}

/// Worker sizing for a cluster-service job: either a fixed replica count or
/// autoscaling bounds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum WorkerCount {
    Fixed(u32),
    Autoscale { min_workers: u32, max_workers: u32 },
}

impl Default for WorkerCount {
    fn default() -> Self {
        Self::Fixed(1)
    }
}

/// Description of a cluster-service compute resource.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClusterResource {
    pub worker_count: WorkerCount,
    pub machine: String,
    pub runtime_version: String,
    pub data_security_mode: String,
    pub cluster_spec_overrides: Option<serde_json::Value>,
    /// Policy name; resolved to a policy id through the backend at
    /// submission time. Defaults to `<group_name>_default`.
    pub cluster_policy: Option<String>,
    /// Reuse a running cluster instead of provisioning one.
    pub existing_cluster_id: Option<String>,
    pub group_name: Option<String>,
    pub credentials: Option<ApiCredentials>,
    pub environment: String,
    pub storage_location: Option<String>,
    /// Additional packages installed on the cluster before the task runs.
    pub libraries: Vec<String>,
    /// First-party modules serialized by value rather than by reference.
    pub register_by_value: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for ClusterResource {
    fn default() -> Self {
        Self {
            worker_count: WorkerCount::default(),
            machine: "i3.xlarge".to_string(),
            runtime_version: "11.3.x-scala2.12".to_string(),
            data_security_mode: "SINGLE_USER".to_string(),
            cluster_spec_overrides: None,
            cluster_policy: None,
            existing_cluster_id: None,
            group_name: None,
            credentials: None,
            environment: "production".to_string(),
            storage_location: None,
            libraries: Vec::new(),
            register_by_value: Vec::new(),
            timeout_seconds: 86_400,
        }
    }
}

impl ClusterResource {
    /// Credentials from the descriptor, falling back to the environment.
    pub fn credentials(&self) -> Result<ApiCredentials, ResourceError> {
        self.credentials
            .clone()
            .or_else(ApiCredentials::from_env)
            .ok_or(ResourceError::MissingCredentials)
    }

    /// The group whose policies and storage the job uses.
    pub fn group(&self) -> &str {
        self.group_name.as_deref().unwrap_or("shared")
    }

    /// The policy name to resolve, defaulting to the group's default policy.
    pub fn policy_name(&self) -> String {
        self.cluster_policy
            .clone()
            .unwrap_or_else(|| format!("{}_default", self.group()))
    }

    /// The staging root for this cluster, defaulting to the group's bucket.
    pub fn storage_location(&self) -> String {
        self.storage_location.clone().unwrap_or_else(|| {
            format!(
                "s3://legate-data-{}/{}/legate/",
                self.environment,
                self.group()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_pool_must_have_one_replica() {
        let resource = TrainingResource {
            coordinator: MachineConfig {
                count: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            resource.validate(),
            Err(ResourceError::CoordinatorReplicas(3))
        ));
        assert!(TrainingResource::default().validate().is_ok());
    }

    #[test]
    fn bare_image_tags_expand_against_the_project_registry() {
        let environment = EnvironmentConfig {
            project: Some("atlas".to_string()),
            image: Some("trainer".to_string()),
            ..Default::default()
        };
        assert_eq!(
            environment.resolved_image().as_deref(),
            Some("us.gcr.io/atlas/trainer")
        );

        let full = EnvironmentConfig {
            image: Some("ghcr.io/acme/trainer:v2".to_string()),
            ..Default::default()
        };
        assert_eq!(
            full.resolved_image().as_deref(),
            Some("ghcr.io/acme/trainer:v2")
        );
    }

    #[test]
    fn storage_location_defaults_follow_the_project_and_group() {
        let environment = EnvironmentConfig {
            project: Some("atlas".to_string()),
            ..Default::default()
        };
        assert_eq!(
            environment.storage_location().as_deref(),
            Some("gs://legate-atlas/")
        );

        let cluster = ClusterResource {
            group_name: Some("ml-platform".to_string()),
            ..Default::default()
        };
        assert_eq!(
            cluster.storage_location(),
            "s3://legate-data-production/ml-platform/legate/"
        );
    }

    #[test]
    fn incomplete_environments_report_missing_fields() {
        let environment = EnvironmentConfig {
            project: Some("atlas".to_string()),
            region: Some("us-central1".to_string()),
            ..Default::default()
        };
        assert!(!environment.is_complete());
        assert_eq!(
            environment.missing_fields(),
            vec!["service_account", "image"]
        );
    }

    #[test]
    fn worker_count_deserializes_both_shapes() {
        let fixed: WorkerCount = serde_yaml::from_str("4").unwrap();
        assert_eq!(fixed, WorkerCount::Fixed(4));

        let autoscale: WorkerCount =
            serde_yaml::from_str("{min_workers: 1, max_workers: 8}").unwrap();
        assert_eq!(
            autoscale,
            WorkerCount::Autoscale {
                min_workers: 1,
                max_workers: 8
            }
        );
    }
}
