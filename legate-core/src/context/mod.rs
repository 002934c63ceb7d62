//! Ambient environment detection.
//!
//! When a training-service descriptor is missing environment fields, they
//! are resolved from the surroundings at call time: first from the workflow
//! orchestrator's runtime (when the caller is a deployed workflow task),
//! then from the cloud VM's metadata server, and finally not at all. The
//! providers form an explicit, ordered list, each exposing the same
//! capability surface (tags, image, project, service account, region), so
//! resolution never depends on inspecting any particular framework.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::resource::EnvironmentConfig;

/// Environment variables injected by the workflow orchestrator's runtime.
pub const WORKFLOW_RUN_ID_VAR: &str = "WORKFLOW_RUN_ID";
pub const WORKFLOW_NAME_VAR: &str = "WORKFLOW_NAME";
pub const WORKFLOW_TASK_RUN_ID_VAR: &str = "WORKFLOW_TASK_RUN_ID";
pub const WORKFLOW_IMAGE_VAR: &str = "WORKFLOW_IMAGE";
pub const WORKFLOW_PROJECT_VAR: &str = "WORKFLOW_PROJECT";
pub const WORKFLOW_SERVICE_ACCOUNT_VAR: &str = "WORKFLOW_SERVICE_ACCOUNT";
pub const WORKFLOW_REGION_VAR: &str = "WORKFLOW_REGION";

/// What a provider knows about the surroundings.
#[derive(Debug, Clone, Default)]
pub struct AmbientContext {
    pub tags: BTreeMap<String, String>,
    pub image: Option<String>,
    pub project: Option<String>,
    pub service_account: Option<String>,
    pub region: Option<String>,
}

/// A source of ambient environment information.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probes the surroundings. `None` means this provider does not apply
    /// here (not an error).
    async fn probe(&self) -> Option<AmbientContext>;
}

/// Context from the workflow orchestrator's runtime, read from the
/// environment variables its deployments inject.
#[derive(Debug, Default)]
pub struct WorkflowContext;

#[async_trait]
impl ContextProvider for WorkflowContext {
    fn name(&self) -> &'static str {
        "workflow"
    }

    async fn probe(&self) -> Option<AmbientContext> {
        // The run id is the marker for running inside a deployment.
        let run_id = std::env::var(WORKFLOW_RUN_ID_VAR).ok()?;
        let mut tags = BTreeMap::new();
        tags.insert("workflow-run-id".to_string(), run_id);
        if let Ok(name) = std::env::var(WORKFLOW_NAME_VAR) {
            tags.insert("workflow-name".to_string(), name);
        }
        if let Ok(task_run) = std::env::var(WORKFLOW_TASK_RUN_ID_VAR) {
            tags.insert("task-run-id".to_string(), task_run);
        }
        Some(AmbientContext {
            tags,
            image: std::env::var(WORKFLOW_IMAGE_VAR).ok(),
            project: std::env::var(WORKFLOW_PROJECT_VAR).ok(),
            service_account: std::env::var(WORKFLOW_SERVICE_ACCOUNT_VAR).ok(),
            region: std::env::var(WORKFLOW_REGION_VAR).ok(),
        })
    }
}

/// Context from the cloud VM's metadata server.
#[derive(Debug, Clone)]
pub struct VmMetadataContext {
    client: reqwest::Client,
    endpoint: String,
}

impl Default for VmMetadataContext {
    fn default() -> Self {
        Self::with_endpoint("http://metadata.internal/v1")
    }
}

impl VmMetadataContext {
    /// Uses an explicit metadata endpoint. Used by tests.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_millis(500))
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, field: &str) -> Option<String> {
        let url = format!("{}/{}", self.endpoint, field);
        let response = self.client.get(&url).send().await.ok()?;
        let response = response.error_for_status().ok()?;
        response.text().await.ok().map(|text| text.trim().to_string())
    }
}

#[async_trait]
impl ContextProvider for VmMetadataContext {
    fn name(&self) -> &'static str {
        "vm-metadata"
    }

    async fn probe(&self) -> Option<AmbientContext> {
        // The project probe doubles as reachability check: off a cloud VM
        // the metadata host does not resolve.
        let project = match self.fetch("project").await {
            Some(project) => project,
            None => {
                warn!(
                    "failure to connect to the metadata host; execution \
                     environment must be outside a cloud VM"
                );
                return None;
            }
        };
        Some(AmbientContext {
            tags: BTreeMap::new(),
            image: self.fetch("image").await,
            project: Some(project),
            service_account: self.fetch("service-account").await,
            region: self.fetch("region").await,
        })
    }
}

/// The standard provider ordering: orchestrator runtime, then VM metadata.
pub fn default_providers() -> Vec<Box<dyn ContextProvider>> {
    vec![
        Box::new(WorkflowContext),
        Box::new(VmMetadataContext::default()),
    ]
}

/// Fills the environment's missing fields from the providers, in order, and
/// collects tags from whichever providers respond.
///
/// Providers past the point where the environment is complete and tags have
/// been found are never probed.
pub async fn resolve_environment(
    environment: &EnvironmentConfig,
    providers: &[Box<dyn ContextProvider>],
) -> (EnvironmentConfig, BTreeMap<String, String>) {
    let mut resolved = environment.clone();
    let mut tags = BTreeMap::new();
    for provider in providers {
        if resolved.is_complete() && !tags.is_empty() {
            break;
        }
        let Some(context) = provider.probe().await else {
            debug!(provider = provider.name(), "provider does not apply");
            continue;
        };
        debug!(provider = provider.name(), "resolved ambient context");
        if tags.is_empty() {
            tags = context.tags;
        }
        resolved.image = resolved.image.or(context.image);
        resolved.project = resolved.project.or(context.project);
        resolved.service_account = resolved.service_account.or(context.service_account);
        resolved.region = resolved.region.or(context.region);
    }
    (resolved, tags)
}
