//! Command line interface for managing long-lived legate resource pools
//! and inspecting the jobs bound to them.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use legate::config::find_default_configuration;
use legate::context::{self, ContextProvider};
use legate::executor::training::{pool_payload, HttpTrainingBackend, TrainingBackend};
use legate::resource::Resource;

#[derive(Parser, Debug)]
#[command(name = "legate", version, about = "Manage legate resource pools and jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage long-lived resource pools on the training service.
    Pool {
        #[command(subcommand)]
        command: PoolCommand,
    },
    /// Inspect jobs on the training service.
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PoolCommand {
    /// Create a resource pool from a configuration block in legate.yaml.
    Create {
        /// Name of the configuration block to use.
        #[arg(long, short)]
        config_name: String,
    },
    /// List resource pools.
    List {
        #[command(flatten)]
        target: Target,
    },
    /// Delete a resource pool.
    Delete {
        /// Id of the pool to delete.
        #[arg(long, short)]
        id: String,
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Subcommand, Debug)]
enum JobsCommand {
    /// List active jobs, optionally narrowed to one pool.
    List {
        /// Only show jobs bound to this pool.
        #[arg(long)]
        pool_id: Option<String>,
        #[command(flatten)]
        target: Target,
    },
}

/// Project/region selection: explicit flags win, ambient context fills the
/// rest.
#[derive(clap::Args, Debug, Clone)]
struct Target {
    /// Project id. Inferred from ambient context if not provided.
    #[arg(long, short)]
    project: Option<String>,
    /// Region. Inferred from ambient context if not provided.
    #[arg(long, short)]
    region: Option<String>,
}

impl Target {
    /// Resolves the parent path, probing the ambient providers for any
    /// field not given on the command line.
    async fn parent(&self) -> Result<(String, String)> {
        let mut project = self.project.clone();
        let mut region = self.region.clone();
        if project.is_none() || region.is_none() {
            for provider in context::default_providers() {
                let Some(ambient) = provider.probe().await else {
                    continue;
                };
                project = project.or(ambient.project);
                region = region.or(ambient.region);
                if project.is_some() && region.is_some() {
                    break;
                }
            }
        }
        let project = project.ok_or_else(|| {
            anyhow!("could not infer a project; pass --project explicitly")
        })?;
        let region = region.ok_or_else(|| {
            anyhow!("could not infer a region; pass --region explicitly")
        })?;
        Ok((project, region))
    }
}

fn backend_for(region: &str) -> HttpTrainingBackend {
    HttpTrainingBackend::for_region(region)
}

fn parent_path(project: &str, region: &str) -> String {
    format!("projects/{project}/locations/{region}")
}

async fn create_pool(config_name: &str) -> Result<()> {
    let resources = find_default_configuration(std::path::Path::new("."))?
        .ok_or_else(|| anyhow!("no legate.yaml found in the working directory"))?;
    let resource = resources
        .get(config_name)
        .ok_or_else(|| anyhow!("no configuration block named {config_name:?}"))?;
    let Resource::Training(resource) = resource else {
        bail!("configuration block {config_name:?} is not a training resource");
    };

    let environment = resource.environment.clone().unwrap_or_default();
    let target = Target {
        project: environment.project.clone(),
        region: environment.region.clone(),
    };
    let (project, region) = target.parent().await?;

    let payload = pool_payload(resource)?;
    let pool_id = resource
        .persistent_resource_id
        .clone()
        .expect("pool_payload requires the id");

    println!("Creating resource pool {pool_id}... this may take several minutes.");
    let name = backend_for(&region)
        .create_pool(&parent_path(&project, &region), &pool_id, &payload)
        .await
        .context("pool creation failed")?;
    println!("Resource pool {name} created successfully.");
    Ok(())
}

async fn list_pools(target: Target) -> Result<()> {
    let (project, region) = target.parent().await?;
    let pools = backend_for(&region)
        .list_pools(&parent_path(&project, &region))
        .await?;
    println!("{}", serde_json::to_string_pretty(&pools)?);
    Ok(())
}

async fn delete_pool(id: &str, target: Target) -> Result<()> {
    let (project, region) = target.parent().await?;
    backend_for(&region)
        .delete_pool(&format!(
            "{}/persistentResources/{id}",
            parent_path(&project, &region)
        ))
        .await
        .context("pool deletion failed")?;
    println!("Resource pool {id} deleted successfully.");
    Ok(())
}

async fn list_jobs(pool_id: Option<String>, target: Target) -> Result<()> {
    let (project, region) = target.parent().await?;
    let jobs = backend_for(&region)
        .list_jobs(&parent_path(&project, &region))
        .await?;

    // Narrow to one pool client-side when asked.
    let jobs = match (&pool_id, jobs) {
        (Some(pool_id), serde_json::Value::Object(mut object)) => {
            if let Some(serde_json::Value::Array(entries)) = object.remove("customJobs") {
                let filtered: Vec<_> = entries
                    .into_iter()
                    .filter(|job| {
                        job.pointer("/jobSpec/persistentResourceId")
                            .and_then(|value| value.as_str())
                            == Some(pool_id.as_str())
                    })
                    .collect();
                serde_json::json!({ "customJobs": filtered })
            } else {
                serde_json::Value::Object(object)
            }
        }
        (_, jobs) => jobs,
    };
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Pool { command } => match command {
            PoolCommand::Create { config_name } => create_pool(&config_name).await,
            PoolCommand::List { target } => list_pools(target).await,
            PoolCommand::Delete { id, target } => delete_pool(&id, target).await,
        },
        Command::Jobs { command } => match command {
            JobsCommand::List { pool_id, target } => list_jobs(pool_id, target).await,
        },
    }
}
