//! Task types.
//!
//! A [`Task`] is the unit of remote execution: a serializable value whose
//! fields are the captured arguments and whose [`run`](Task::run) is the
//! function body. Because the task is plain data, it can be staged to remote
//! storage by an [`Executor`](crate::executor::Executor) and executed by any
//! process that links the same type, typically a small runner binary built
//! into the container image, which hands control to
//! [`bootstrap`](crate::bootstrap).
//!
//! ```
//! use legate::task::Task;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug)]
//! struct Add {
//!     a: i64,
//!     b: i64,
//! }
//!
//! impl Task for Add {
//!     type Output = i64;
//!
//!     fn run(&self) -> anyhow::Result<Self::Output> {
//!         Ok(self.a + self.b)
//!     }
//! }
//!
//! assert_eq!(Add { a: 1, b: 2 }.run().unwrap(), 3);
//! ```
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::Payload;

/// A unit of work that can be staged for execution on a remote resource.
///
/// The task must carry everything its body needs: there are no call-time
/// arguments, mirroring the fact that the remote side only ever sees the
/// serialized value. The output must itself be a [`Payload`] so the result
/// artifact can be shipped back.
pub trait Task: Payload {
    type Output: Payload;

    /// Executes the task. Runs in the submitting process on the local
    /// backend and inside the remote container on managed backends.
    fn run(&self) -> anyhow::Result<Self::Output>;
}

/// A task that participates in hyperparameter tuning.
///
/// The backend runs many trials of the task, each with a different
/// hyperparameter assignment drawn from the study's search space. Each trial
/// reports its metrics back to the tuning service rather than producing an
/// output artifact.
pub trait TunableTask: Payload {
    /// Executes one trial under the given hyperparameter assignment and
    /// returns the metric values to report.
    fn run_trial(&self, hyperparameters: &Hyperparameters) -> anyhow::Result<TrialMetrics>;
}

/// A hyperparameter assignment for a single tuning trial.
pub type Hyperparameters = BTreeMap<String, ParamValue>;

/// Metric values reported by a tuning trial, keyed by metric id.
pub type TrialMetrics = BTreeMap<String, f64>;

/// A hyperparameter value as received on the remote command line.
///
/// Values arrive as strings; [`ParamValue::parse`] narrows each one to the
/// most specific representation it satisfies. Externally tagged so values
/// survive the non-self-describing wire codec.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Parses a raw argument value, preferring the narrowest type that
    /// accepts it.
    pub fn parse(raw: &str) -> Self {
        if let Ok(value) = raw.parse::<bool>() {
            return Self::Bool(value);
        }
        if let Ok(value) = raw.parse::<i64>() {
            return Self::Int(value);
        }
        if let Ok(value) = raw.parse::<f64>() {
            return Self::Float(value);
        }
        Self::Text(raw.to_string())
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_narrowest_value() {
        assert_eq!(ParamValue::parse("true"), ParamValue::Bool(true));
        assert_eq!(ParamValue::parse("42"), ParamValue::Int(42));
        assert_eq!(ParamValue::parse("0.125"), ParamValue::Float(0.125));
        assert_eq!(
            ParamValue::parse("adamw"),
            ParamValue::Text("adamw".to_string())
        );
    }
}
