//! Hyperparameter tuning: study configuration and the trial-result reducer.

use std::collections::BTreeMap;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::task::ParamValue;

/// Optimization direction for the study's metric.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    #[default]
    Maximize,
    Minimize,
}

impl Goal {
    pub fn api_name(&self) -> &'static str {
        match self {
            Self::Maximize => "MAXIMIZE",
            Self::Minimize => "MINIMIZE",
        }
    }
}

/// Scaling applied to a numeric parameter's search space.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    UnitLinear,
    UnitLog,
    UnitReverseLog,
}

impl Scale {
    pub fn api_name(&self) -> &'static str {
        match self {
            Self::UnitLinear => "UNIT_LINEAR_SCALE",
            Self::UnitLog => "UNIT_LOG_SCALE",
            Self::UnitReverseLog => "UNIT_REVERSE_LOG_SCALE",
        }
    }
}

/// One dimension of the search space, keyed by parameter kind.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Param {
    Discrete {
        name: String,
        values: Vec<f64>,
    },
    Categorical {
        name: String,
        values: Vec<String>,
    },
    Integer {
        name: String,
        min: i64,
        max: i64,
        #[serde(default)]
        scale: Option<Scale>,
    },
    Double {
        name: String,
        min: f64,
        max: f64,
        #[serde(default)]
        scale: Option<Scale>,
    },
}

impl Param {
    pub fn name(&self) -> &str {
        match self {
            Self::Discrete { name, .. }
            | Self::Categorical { name, .. }
            | Self::Integer { name, .. }
            | Self::Double { name, .. } => name,
        }
    }
}

/// A tuning study: the metric to optimize, its direction, the search space,
/// and trial scheduling.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Tune {
    pub metric: String,
    pub params: Vec<Param>,
    #[serde(default)]
    pub goal: Goal,
    #[serde(default = "default_trials")]
    pub trials: u32,
    #[serde(default = "default_trials")]
    pub parallel: u32,
    #[serde(default)]
    pub algorithm: Option<String>,
}

fn default_trials() -> u32 {
    1
}

impl Tune {
    pub fn new(metric: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            metric: metric.into(),
            params,
            goal: Goal::default(),
            trials: 1,
            parallel: 1,
            algorithm: None,
        }
    }
}

/// One completed trial as reported by the tuning service.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrialReport {
    pub trial_id: String,
    pub state: String,
    pub metric: f64,
    pub parameters: BTreeMap<String, ParamValue>,
}

/// The reduced outcome of a study: the best trial's metric and parameters,
/// plus every succeeded trial ranked by the optimization goal.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TuneResult {
    pub metric: f64,
    pub hyperparameters: BTreeMap<String, ParamValue>,
    pub trials: Vec<TrialReport>,
}

/// Ranks the study's succeeded trials by the goal direction and returns the
/// best as the result.
pub fn reduce(goal: Goal, trials: Vec<TrialReport>) -> anyhow::Result<TuneResult> {
    let mut trials: Vec<TrialReport> = trials
        .into_iter()
        .filter(|trial| trial.state == "SUCCEEDED")
        .collect();
    trials.sort_by(|a, b| {
        let ordering = a
            .metric
            .partial_cmp(&b.metric)
            .unwrap_or(std::cmp::Ordering::Equal);
        match goal {
            Goal::Maximize => ordering.reverse(),
            Goal::Minimize => ordering,
        }
    });
    let best = trials
        .first()
        .ok_or_else(|| anyhow!("tuning job reported no succeeded trials"))?;
    Ok(TuneResult {
        metric: best.metric,
        hyperparameters: best.parameters.clone(),
        trials: trials.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial(id: &str, metric: f64) -> TrialReport {
        let mut parameters = BTreeMap::new();
        parameters.insert("learning_rate".to_string(), ParamValue::Float(metric / 10.0));
        TrialReport {
            trial_id: id.to_string(),
            state: "SUCCEEDED".to_string(),
            metric,
            parameters,
        }
    }

    #[test]
    fn maximize_returns_the_highest_metric_and_ranks_descending() {
        let trials = vec![trial("1", 3.0), trial("2", 7.0), trial("3", 1.0), trial("4", 9.0)];
        let result = reduce(Goal::Maximize, trials).unwrap();

        assert_eq!(result.metric, 9.0);
        assert_eq!(
            result.hyperparameters.get("learning_rate"),
            Some(&ParamValue::Float(0.9))
        );
        let ranked: Vec<f64> = result.trials.iter().map(|t| t.metric).collect();
        assert_eq!(ranked, vec![9.0, 7.0, 3.0, 1.0]);
    }

    #[test]
    fn minimize_reverses_the_ranking() {
        let trials = vec![trial("1", 3.0), trial("2", 7.0), trial("3", 1.0)];
        let result = reduce(Goal::Minimize, trials).unwrap();
        assert_eq!(result.metric, 1.0);
    }

    #[test]
    fn failed_trials_are_excluded() {
        let mut bad = trial("1", 100.0);
        bad.state = "FAILED".to_string();
        let result = reduce(Goal::Maximize, vec![bad, trial("2", 2.0)]).unwrap();
        assert_eq!(result.metric, 2.0);
        assert_eq!(result.trials.len(), 1);
    }

    #[test]
    fn an_empty_study_is_an_error() {
        assert!(reduce(Goal::Maximize, Vec::new()).is_err());
    }
}
