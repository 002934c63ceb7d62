#![cfg_attr(docsrs, feature(doc_cfg))]

//! Remote execution façade for Rust.
//!
//! Legate lets a caller take an ordinary unit of work and run it
//! transparently on a remote compute backend (a managed ML training
//! service, a managed data-engineering cluster, or the local process),
//! waiting for completion and returning the deserialized result as if the
//! call had been local.
//!
//! Features:
//! - **Uniform lifecycle**: one executor contract (stage, start, poll,
//!   fetch) across every backend, local execution included.
//! - **Declarative resources**: backend choice and cluster shape live in a
//!   [`Resource`](crate::resource::Resource) descriptor or a `legate.yaml`
//!   next to your code, not in the call site.
//! - **Ambient awareness**: missing environment details (image, project,
//!   service account, region) resolve from the workflow orchestrator's
//!   runtime or the VM metadata server at call time.
//! - **Multi-node startup**: distributed jobs ship a startup descriptor
//!   alongside the task; plain multi-node, scheduler clusters, and
//!   process-group training are built in.
//!
//! # How to use legate
//!
//! Work is expressed as a [`Task`](crate::task::Task): a serializable
//! struct whose fields are the captured arguments and whose `run` is the
//! function body.
//!
//! ```
//! use legate::{remote::Remote, task::Task};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct TrainModel {
//!     epochs: u32,
//! }
//!
//! impl Task for TrainModel {
//!     type Output = f64;
//!
//!     fn run(&self) -> anyhow::Result<f64> {
//!         Ok(0.97_f64.powi(self.epochs as i32))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // No resource configured: runs in-process, same interface.
//!     let loss = Remote::new(TrainModel { epochs: 3 }).run().await?;
//!     assert!(loss < 1.0);
//!     Ok(())
//! }
//! ```
//!
//! Attaching a [`TrainingResource`](crate::resource::TrainingResource) or a
//! [`ClusterResource`](crate::resource::ClusterResource) sends the same
//! task to the matching backend instead: the task is serialized to the
//! job's staging directory, a backend job is submitted, its status polled
//! to a terminal state, and the output artifact is read back, or the
//! distinguished [`Cancelled`](crate::executor::ExecutorError::Cancelled) /
//! [`Failed`](crate::executor::ExecutorError::Failed) error is raised with
//! the backend's raw status for console lookup.
//!
//! # Application and deployment architecture
//!
//! We suggest the following project layout:
//! ```bash
//! tasks
//! ├── Cargo.toml
//! └── src
//!    └── lib.rs
//! runner
//! ├── Cargo.toml
//! └── src
//!    └── main.rs
//! submitter
//! ├── Cargo.toml
//! └── src
//!    └── main.rs
//! ```
//!
//! Here's a breakdown:
//! - `tasks`: a library with your task definitions, shared between `runner`
//!   and `submitter`.
//! - `runner`: the container entrypoint baked into the job image; a thin
//!   `main` over [`bootstrap::execute`](crate::bootstrap::execute).
//! - `submitter`: whatever process calls
//!   [`Remote::run`](crate::remote::Remote::run): a workflow task, a CLI,
//!   a service.
//!
//! The staged task is decoded by the runner because both sides link the
//! same `tasks` crate; nothing about the task crosses the wire except its
//! serialized fields.
pub mod bootstrap;
pub mod codec;
pub mod common;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod distributed;
pub mod executor;
pub mod remote;
pub mod resource;
pub mod storage;
pub mod task;

pub use executor::training::{Goal, Param, Scale, Tune, TuneResult};
pub use executor::{Executor, ExecutorError, JobStatus};
pub use remote::Remote;
pub use resource::{ClusterResource, Resource, TrainingResource};
pub use task::{Task, TunableTask};

pub use async_trait::async_trait;
pub use futures;
pub use tracing;
