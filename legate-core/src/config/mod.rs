//! Resource configuration files.
//!
//! A `legate.yaml` (or `legate.yml`) in the working directory maps job
//! names to resource blocks, so resources can be declared next to the code
//! that submits them:
//!
//! ```yaml
//! default:
//!   training:
//!     environment:
//!       project: atlas
//!       region: us-central1
//!
//! train-model:
//!   type: training
//!   coordinator:
//!     kind: n1-highmem-16
//! ```
//!
//! A special `default` block holds per-type defaults that are deep-merged
//! underneath every named block of the matching type: named-block leaf
//! values win on conflict, nested mappings merge recursively.

use std::collections::BTreeMap;
use std::path::Path;

use serde_yaml::Value;
use thiserror::Error;
use tracing::info;

use crate::resource::{Resource, ResourceError};

/// Filenames probed, in order, in the working directory.
pub const CONFIG_FILENAMES: [&str; 2] = ["legate.yaml", "legate.yml"];

const DEFAULT_BLOCK: &str = "default";
const TYPE_FIELD: &str = "type";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("resource block {0:?} must be a mapping with a `type` field")]
    InvalidBlock(String),
    #[error("unsupported resource type {0:?} (expected local, cluster, or training)")]
    UnsupportedType(String),
    #[error(transparent)]
    InvalidResource(#[from] ResourceError),
}

/// Looks for a configuration file in `root` and parses it. Returns `None`
/// when no file exists.
pub fn find_default_configuration(
    root: &Path,
) -> Result<Option<BTreeMap<String, Resource>>, ConfigError> {
    for filename in CONFIG_FILENAMES {
        let path = root.join(filename);
        if !path.exists() {
            continue;
        }
        info!(path = %path.display(), "found legate configuration");
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        return Ok(Some(parse_configuration(&text)?));
    }
    Ok(None)
}

/// Parses configuration text into validated resources.
pub fn parse_configuration(text: &str) -> Result<BTreeMap<String, Resource>, ConfigError> {
    let document: Value = serde_yaml::from_str(text)?;
    let Value::Mapping(blocks) = document else {
        return Err(ConfigError::InvalidBlock("<document>".to_string()));
    };

    let defaults = blocks
        .get(DEFAULT_BLOCK)
        .cloned()
        .unwrap_or(Value::Mapping(Default::default()));

    let mut resources = BTreeMap::new();
    for (name, block) in &blocks {
        let Some(name) = name.as_str() else {
            return Err(ConfigError::InvalidBlock(format!("{name:?}")));
        };
        if name == DEFAULT_BLOCK {
            continue;
        }
        let kind = block
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::InvalidBlock(name.to_string()))?;
        if !matches!(kind, "local" | "cluster" | "training") {
            return Err(ConfigError::UnsupportedType(kind.to_string()));
        }

        let type_defaults = defaults.get(kind).cloned().unwrap_or_default();
        let merged = merge(&type_defaults, block);
        let resource: Resource = serde_yaml::from_value(merged)?;
        resource.validate()?;
        resources.insert(name.to_string(), resource);
    }
    Ok(resources)
}

/// Deep merge: values in `overlay` override values in `base`; nested
/// mappings merge recursively.
fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let entry = match base_map.get(key) {
                    Some(existing) => merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Mapping(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::WorkerCount;

    #[test]
    fn deep_merge_law() {
        let base: Value = serde_yaml::from_str("{a: 1, b: {x: 1}}").unwrap();
        let overlay: Value = serde_yaml::from_str("{b: {y: 2}, c: 3}").unwrap();
        let merged = merge(&base, &overlay);
        let expected: Value = serde_yaml::from_str("{a: 1, b: {x: 1, y: 2}, c: 3}").unwrap();
        assert_eq!(merged, expected);
    }

    #[test]
    fn overlay_leaf_values_win() {
        let base: Value = serde_yaml::from_str("{hello: world}").unwrap();
        let overlay: Value = serde_yaml::from_str("{hello: goodbye}").unwrap();
        assert_eq!(merge(&base, &overlay), overlay);
    }

    #[test]
    fn named_blocks_merge_over_matching_type_defaults() {
        let text = r#"
default:
  training:
    environment:
      project: atlas
      region: us-central1
  cluster:
    group_name: ml-platform

train-model:
  type: training
  environment:
    region: europe-west4
  coordinator:
    kind: n1-highmem-16

backfill:
  type: cluster
  worker_count: 4
"#;
        let resources = parse_configuration(text).unwrap();

        let Resource::Training(train) = &resources["train-model"] else {
            panic!("expected a training resource");
        };
        let environment = train.environment.as_ref().unwrap();
        // Default project survives, the named block's region wins.
        assert_eq!(environment.project.as_deref(), Some("atlas"));
        assert_eq!(environment.region.as_deref(), Some("europe-west4"));
        assert_eq!(train.coordinator.kind, "n1-highmem-16");

        let Resource::Cluster(backfill) = &resources["backfill"] else {
            panic!("expected a cluster resource");
        };
        assert_eq!(backfill.group_name.as_deref(), Some("ml-platform"));
        assert_eq!(backfill.worker_count, WorkerCount::Fixed(4));
    }

    #[test]
    fn unsupported_types_are_rejected() {
        let text = "job:\n  type: mainframe\n";
        assert!(matches!(
            parse_configuration(text),
            Err(ConfigError::UnsupportedType(kind)) if kind == "mainframe"
        ));
    }

    #[test]
    fn blocks_without_a_type_are_rejected() {
        let text = "job:\n  coordinator:\n    count: 1\n";
        assert!(matches!(
            parse_configuration(text),
            Err(ConfigError::InvalidBlock(name)) if name == "job"
        ));
    }

    #[test]
    fn invalid_coordinator_counts_fail_validation() {
        let text = "job:\n  type: training\n  coordinator:\n    count: 2\n";
        assert!(matches!(
            parse_configuration(text),
            Err(ConfigError::InvalidResource(
                ResourceError::CoordinatorReplicas(2)
            ))
        ));
    }

    #[test]
    fn discovers_files_by_fixed_name() {
        let dir = std::env::temp_dir().join(format!("legate-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(find_default_configuration(&dir).unwrap().is_none());

        std::fs::write(dir.join("legate.yml"), "job:\n  type: local\n").unwrap();
        let resources = find_default_configuration(&dir).unwrap().unwrap();
        assert!(matches!(resources["job"], Resource::Local));
        std::fs::remove_dir_all(&dir).ok();
    }
}
