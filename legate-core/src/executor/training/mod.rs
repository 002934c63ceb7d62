//! The managed-training-service backend.
//!
//! Jobs are submitted as custom jobs (or hyperparameter tuning jobs) to the
//! service's regional API. The executor resolves the environment, stages
//! the task (plus the distributed-job descriptor, when present) and polls
//! the job state. See [`tune`] for the tuning model and [`job`] for the
//! payload shapes.

pub mod api;
pub mod executor;
pub mod job;
pub mod tune;

pub use api::{HttpTrainingBackend, TrainingBackend};
pub use executor::{TrainingExecutor, TuningExecutor};
pub use job::{pool_payload, TrainingJob};
pub use tune::{Goal, Param, Scale, Tune, TuneResult};
