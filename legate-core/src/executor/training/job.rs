//! Data model for jobs on the training service.
//!
//! [`TrainingJob`] converts a [`TrainingResource`] plus the staged-task
//! location into the exact payload the service's job APIs expect. It does
//! not cover the whole service API: jobs always run a custom container (the
//! resource's image) whose entrypoint is the runner binary that loads the
//! staged task.

use std::collections::BTreeMap;

use serde::Serialize;

use super::tune::{Param, Tune};
use crate::common::{safe_label, safe_label_key};
use crate::executor::ExecutorError;
use crate::resource::{EnvironmentConfig, MachineConfig, ResourceError, TrainingResource};

/// The runner binary expected on the image's path; it re-enters
/// [`bootstrap`](crate::bootstrap) with the arguments below.
pub const RUNNER_COMMAND: &str = "legate-runner";

/// A description of one job on the training service. Created fresh per
/// submission and not persisted beyond it.
#[derive(Debug, Clone)]
pub struct TrainingJob {
    pub display_name: String,
    pub resource: TrainingResource,
    /// The resolved, complete environment the job runs in.
    pub environment: EnvironmentConfig,
    /// Full path to the staging directory (includes the storage key).
    pub storage_path: String,
    pub tune: Option<Tune>,
    pub dashboard: bool,
    pub web_console: bool,
    pub labels: BTreeMap<String, String>,
    /// Storage path of first-party code fetched by the bootstrap before the
    /// task is loaded.
    pub code_package: Option<String>,
}

/// Either payload shape the service accepts.
#[derive(Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum SubmissionPayload {
    Job(JobPayload),
    Tuning(TuningJobPayload),
}

#[derive(Serialize, Debug, Clone)]
pub struct JobPayload {
    pub display_name: String,
    pub job_spec: JobSpec,
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct TuningJobPayload {
    pub display_name: String,
    pub trial_job_spec: JobSpec,
    pub max_trial_count: u32,
    pub parallel_trial_count: u32,
    pub study_spec: StudySpec,
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct JobSpec {
    pub worker_pool_specs: Vec<WorkerPoolSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_dashboard_access: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_web_access: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_resource_id: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct WorkerPoolSpec {
    pub replica_count: u32,
    pub machine_spec: MachineSpec,
    pub container_spec: ContainerSpec,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nfs_mounts: Vec<NfsMountSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_spec: Option<DiskSpec>,
}

#[derive(Serialize, Debug, Clone)]
pub struct MachineSpec {
    pub machine_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accelerator_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accelerator_count: Option<u32>,
}

#[derive(Serialize, Debug, Clone)]
pub struct ContainerSpec {
    pub image_uri: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct DiskSpec {
    pub boot_disk_size_gb: u32,
}

#[derive(Serialize, Debug, Clone)]
pub struct NfsMountSpec {
    pub server: String,
    pub path: String,
    pub mount_point: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct StudySpec {
    pub metrics: Vec<MetricSpec>,
    pub parameters: Vec<ParameterSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct MetricSpec {
    pub metric_id: String,
    pub goal: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct ParameterSpec {
    pub parameter_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub double_value_spec: Option<DoubleValueSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integer_value_spec: Option<IntegerValueSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categorical_value_spec: Option<CategoricalValueSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discrete_value_spec: Option<DiscreteValueSpec>,
}

#[derive(Serialize, Debug, Clone)]
pub struct DoubleValueSpec {
    pub min_value: f64,
    pub max_value: f64,
}

#[derive(Serialize, Debug, Clone)]
pub struct IntegerValueSpec {
    pub min_value: i64,
    pub max_value: i64,
}

#[derive(Serialize, Debug, Clone)]
pub struct CategoricalValueSpec {
    pub values: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct DiscreteValueSpec {
    pub values: Vec<f64>,
}

impl TrainingJob {
    /// Builds the submission payload, enforcing the cluster-shape and label
    /// invariants.
    pub fn payload(&self) -> Result<SubmissionPayload, ExecutorError> {
        let labels = self.safe_labels()?;
        let job_spec = self.job_spec()?;
        Ok(match &self.tune {
            None => SubmissionPayload::Job(JobPayload {
                display_name: self.display_name.clone(),
                job_spec,
                labels,
            }),
            Some(tune) => SubmissionPayload::Tuning(TuningJobPayload {
                display_name: self.display_name.clone(),
                trial_job_spec: job_spec,
                max_trial_count: tune.trials,
                parallel_trial_count: tune.parallel,
                study_spec: study_spec(tune),
                labels,
            }),
        })
    }

    fn safe_labels(&self) -> Result<BTreeMap<String, String>, ExecutorError> {
        self.labels
            .iter()
            .map(|(key, value)| Ok((safe_label_key(key)?, safe_label(value))))
            .collect()
    }

    fn job_spec(&self) -> Result<JobSpec, ExecutorError> {
        Ok(JobSpec {
            worker_pool_specs: self.pool_specs()?,
            network: self.environment.network.clone(),
            service_account: self.environment.service_account.clone(),
            enable_dashboard_access: self.dashboard.then_some(true),
            enable_web_access: self.web_console.then_some(true),
            persistent_resource_id: self.resource.persistent_resource_id.clone(),
        })
    }

    /// The coordinator pool first, always exactly one replica, then the
    /// optional worker pool.
    fn pool_specs(&self) -> Result<Vec<WorkerPoolSpec>, ExecutorError> {
        if self.resource.coordinator.count != 1 {
            return Err(ResourceError::CoordinatorReplicas(self.resource.coordinator.count).into());
        }
        let mut pools = vec![self.pool_spec(&self.resource.coordinator)?];
        if let Some(workers) = &self.resource.workers {
            pools.push(self.pool_spec(workers)?);
        }
        Ok(pools)
    }

    fn pool_spec(&self, machine: &MachineConfig) -> Result<WorkerPoolSpec, ExecutorError> {
        Ok(WorkerPoolSpec {
            replica_count: machine.count,
            machine_spec: MachineSpec {
                machine_type: machine.kind.clone(),
                accelerator_type: machine
                    .accelerator
                    .as_ref()
                    .map(|accelerator| accelerator.kind.clone()),
                accelerator_count: machine
                    .accelerator
                    .as_ref()
                    .map(|accelerator| accelerator.count),
            },
            container_spec: self.container_spec()?,
            nfs_mounts: machine
                .nfs_mounts
                .iter()
                .map(|mount| NfsMountSpec {
                    server: mount.server.clone(),
                    path: mount.path.clone(),
                    mount_point: mount.mount_point.clone(),
                })
                .collect(),
            disk_spec: machine
                .disk_size_gb
                .map(|boot_disk_size_gb| DiskSpec { boot_disk_size_gb }),
        })
    }

    /// The image and its entrypoint: the runner binary, pointed at the
    /// staging path, with the distributed flag and code-package path.
    fn container_spec(&self) -> Result<ContainerSpec, ExecutorError> {
        let image_uri = self
            .environment
            .resolved_image()
            .ok_or(ExecutorError::IncompleteEnvironment {
                missing: vec!["image"],
            })?;
        let distributed = self.resource.distributed_job.is_some();
        Ok(ContainerSpec {
            image_uri,
            command: vec![
                RUNNER_COMMAND.to_string(),
                self.storage_path.clone(),
                distributed.to_string(),
                self.code_package.clone().unwrap_or_default(),
            ],
            args: Vec::new(),
        })
    }
}

fn study_spec(tune: &Tune) -> StudySpec {
    StudySpec {
        metrics: vec![MetricSpec {
            metric_id: tune.metric.clone(),
            goal: tune.goal.api_name().to_string(),
        }],
        parameters: tune.params.iter().map(parameter_spec).collect(),
        algorithm: tune.algorithm.clone(),
    }
}

fn parameter_spec(param: &Param) -> ParameterSpec {
    let mut spec = ParameterSpec {
        parameter_id: param.name().to_string(),
        scale_type: None,
        double_value_spec: None,
        integer_value_spec: None,
        categorical_value_spec: None,
        discrete_value_spec: None,
    };
    match param {
        Param::Double {
            min, max, scale, ..
        } => {
            spec.scale_type = scale.map(|s| s.api_name().to_string());
            spec.double_value_spec = Some(DoubleValueSpec {
                min_value: *min,
                max_value: *max,
            });
        }
        Param::Integer {
            min, max, scale, ..
        } => {
            spec.scale_type = scale.map(|s| s.api_name().to_string());
            spec.integer_value_spec = Some(IntegerValueSpec {
                min_value: *min,
                max_value: *max,
            });
        }
        Param::Categorical { values, .. } => {
            spec.categorical_value_spec = Some(CategoricalValueSpec {
                values: values.clone(),
            });
        }
        Param::Discrete { values, .. } => {
            spec.discrete_value_spec = Some(DiscreteValueSpec {
                values: values.clone(),
            });
        }
    }
    spec
}

/// Payload for creating a long-lived resource pool.
#[derive(Serialize, Debug, Clone)]
pub struct PoolPayload {
    pub display_name: String,
    pub resource_pools: Vec<ResourcePool>,
}

#[derive(Serialize, Debug, Clone)]
pub struct ResourcePool {
    pub machine_spec: MachineSpec,
    pub replica_count: u32,
    pub disk_spec: PoolDiskSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaling_spec: Option<AutoscalingSpec>,
}

#[derive(Serialize, Debug, Clone)]
pub struct PoolDiskSpec {
    pub boot_disk_type: String,
    pub boot_disk_size_gb: u32,
}

#[derive(Serialize, Debug, Clone)]
pub struct AutoscalingSpec {
    pub min_replica_count: u32,
    pub max_replica_count: u32,
}

/// Builds the persistent-pool payload from a resource's machine pools.
pub fn pool_payload(resource: &TrainingResource) -> Result<PoolPayload, ExecutorError> {
    let pool_id = resource
        .persistent_resource_id
        .clone()
        .ok_or(ResourceError::MissingPoolId)?;
    let pools = std::iter::once(&resource.coordinator)
        .chain(resource.workers.as_ref())
        .map(|machine| ResourcePool {
            machine_spec: MachineSpec {
                machine_type: machine.kind.clone(),
                accelerator_type: machine
                    .accelerator
                    .as_ref()
                    .map(|accelerator| accelerator.kind.clone()),
                accelerator_count: machine
                    .accelerator
                    .as_ref()
                    .map(|accelerator| accelerator.count),
            },
            replica_count: machine.count,
            // Matches the default disk spec of submitted jobs.
            disk_spec: PoolDiskSpec {
                boot_disk_type: "pd-ssd".to_string(),
                boot_disk_size_gb: machine.disk_size_gb.unwrap_or(100),
            },
            autoscaling_spec: match (machine.min_replica_count, machine.max_replica_count) {
                (None, None) => None,
                (min, max) => Some(AutoscalingSpec {
                    min_replica_count: min.unwrap_or(0),
                    max_replica_count: max.unwrap_or(0),
                }),
            },
        })
        .collect();
    Ok(PoolPayload {
        display_name: pool_id,
        resource_pools: pools,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::AcceleratorConfig;

    fn environment() -> EnvironmentConfig {
        EnvironmentConfig {
            project: Some("atlas".to_string()),
            service_account: Some("trainer@atlas.iam".to_string()),
            region: Some("us-central1".to_string()),
            image: Some("trainer".to_string()),
            network: Some("projects/atlas/global/networks/shared".to_string()),
            storage_location: None,
        }
    }

    fn base_job() -> TrainingJob {
        TrainingJob {
            display_name: "test-job".to_string(),
            resource: TrainingResource::default(),
            environment: environment(),
            storage_path: "gs://legate-atlas/key-1".to_string(),
            tune: None,
            dashboard: false,
            web_console: false,
            labels: BTreeMap::new(),
            code_package: None,
        }
    }

    #[test]
    fn builds_a_plain_job_payload() {
        let mut job = base_job();
        job.labels
            .insert("hello".to_string(), "WORLD".to_string());
        let payload = job.payload().unwrap();
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(value["display_name"], "test-job");
        assert_eq!(value["labels"]["hello"], "world");
        assert_eq!(value["job_spec"]["service_account"], "trainer@atlas.iam");
        let command = &value["job_spec"]["worker_pool_specs"][0]["container_spec"]["command"];
        assert_eq!(command[0], RUNNER_COMMAND);
        assert_eq!(command[1], "gs://legate-atlas/key-1");
        assert_eq!(command[2], "false");
        assert_eq!(
            value["job_spec"]["worker_pool_specs"][0]["container_spec"]["image_uri"],
            "us.gcr.io/atlas/trainer"
        );
    }

    #[test]
    fn invalid_label_keys_are_rejected() {
        for key in ["1key", ""] {
            let mut job = base_job();
            job.labels.insert(key.to_string(), "val".to_string());
            assert!(matches!(
                job.payload(),
                Err(ExecutorError::InvalidLabel(_))
            ));
        }
    }

    #[test]
    fn rejects_multi_replica_coordinators() {
        let mut job = base_job();
        job.resource.coordinator.count = 2;
        assert!(matches!(
            job.payload(),
            Err(ExecutorError::InvalidResource(
                ResourceError::CoordinatorReplicas(2)
            ))
        ));
    }

    #[test]
    fn accelerators_and_workers_shape_the_pools() {
        let mut job = base_job();
        job.resource.coordinator.accelerator = Some(AcceleratorConfig::default());
        job.resource.coordinator.disk_size_gb = Some(200);
        job.resource.workers = Some(MachineConfig {
            count: 4,
            ..Default::default()
        });
        let value = serde_json::to_value(job.payload().unwrap()).unwrap();
        let pools = value["job_spec"]["worker_pool_specs"].as_array().unwrap();

        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0]["replica_count"], 1);
        assert_eq!(pools[0]["machine_spec"]["accelerator_type"], "NVIDIA_TESLA_T4");
        assert_eq!(pools[0]["disk_spec"]["boot_disk_size_gb"], 200);
        assert_eq!(pools[1]["replica_count"], 4);
    }

    #[test]
    fn tuning_payloads_carry_the_study_spec() {
        let mut job = base_job();
        job.tune = Some(Tune {
            trials: 4,
            parallel: 2,
            ..Tune::new(
                "sum",
                vec![
                    Param::Double {
                        name: "a".to_string(),
                        min: 0.0,
                        max: 9.3,
                        scale: Some(super::super::tune::Scale::UnitLog),
                    },
                    Param::Integer {
                        name: "b".to_string(),
                        min: 0,
                        max: 4,
                        scale: None,
                    },
                ],
            )
        });
        let value = serde_json::to_value(job.payload().unwrap()).unwrap();

        assert_eq!(value["max_trial_count"], 4);
        assert_eq!(value["parallel_trial_count"], 2);
        assert_eq!(value["study_spec"]["metrics"][0]["metric_id"], "sum");
        assert_eq!(value["study_spec"]["metrics"][0]["goal"], "MAXIMIZE");
        let params = value["study_spec"]["parameters"].as_array().unwrap();
        assert_eq!(params[0]["scale_type"], "UNIT_LOG_SCALE");
        assert_eq!(params[0]["double_value_spec"]["max_value"], 9.3);
        assert_eq!(params[1]["integer_value_spec"]["max_value"], 4);
        assert!(params[1].get("scale_type").is_none());
        assert!(value.get("job_spec").is_none());
    }

    #[test]
    fn pool_payloads_include_autoscaling_bounds() {
        let resource = TrainingResource {
            coordinator: MachineConfig {
                min_replica_count: Some(1),
                max_replica_count: Some(5),
                ..Default::default()
            },
            persistent_resource_id: Some("shared-pool".to_string()),
            ..Default::default()
        };
        let payload = pool_payload(&resource).unwrap();
        assert_eq!(payload.display_name, "shared-pool");
        let autoscaling = payload.resource_pools[0].autoscaling_spec.as_ref().unwrap();
        assert_eq!(autoscaling.min_replica_count, 1);
        assert_eq!(autoscaling.max_replica_count, 5);

        assert!(pool_payload(&TrainingResource::default()).is_err());
    }

    #[test]
    fn distributed_jobs_flip_the_bootstrap_flag() {
        let mut job = base_job();
        job.resource.distributed_job =
            Some(crate::distributed::DistributedJob::MultiNode(Default::default()));
        let value = serde_json::to_value(job.payload().unwrap()).unwrap();
        let command = &value["job_spec"]["worker_pool_specs"][0]["container_spec"]["command"];
        assert_eq!(command[2], "true");
    }
}
