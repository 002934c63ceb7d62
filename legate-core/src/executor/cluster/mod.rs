//! The managed-cluster backend.
//!
//! Jobs are submitted as one-off runs to the cluster service's run API. The
//! executor resolves a cluster policy, uploads a bootstrap script next to
//! the staged task, submits the run payload, and polls the run state.

pub mod api;
pub mod executor;
pub mod job;

pub use api::{ClusterBackend, HttpClusterBackend};
pub use executor::ClusterExecutor;
pub use job::ClusterJob;
