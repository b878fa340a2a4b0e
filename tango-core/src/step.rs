//! Steps, the named and cacheable units of work, and the records kept about them.

use crate::error::TangoError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// What a running step can see of the outside world.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub unique_id: String,
    /// Scratch directory for restartable state and side outputs.
    pub work_dir: PathBuf,
    /// Results of this step's dependencies, keyed by step name.
    pub inputs: HashMap<String, serde_json::Value>,
}

/// A unit of work in an experiment.
pub trait Step: Send + Sync {
    /// Name of the step inside its step graph.
    fn name(&self) -> &str;

    /// Registered type name, e.g. `"flax::eval"`.
    fn class_name(&self) -> &str;

    /// Configuration that identifies this step's result.
    fn config(&self) -> serde_json::Value;

    /// Top-level config keys that do not change the result.
    fn skip_id_arguments(&self) -> &[&str] {
        &[]
    }

    fn version(&self) -> Option<&str> {
        None
    }

    fn deterministic(&self) -> bool {
        true
    }

    fn cacheable(&self) -> bool {
        self.deterministic()
    }

    /// Names of the steps whose results this step consumes.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn run(&self, ctx: &StepContext) -> Result<serde_json::Value, TangoError>;

    /// Stable identifier derived from the class name, version and config.
    fn unique_id(&self) -> String {
        compute_unique_id(
            self.class_name(),
            self.version(),
            &self.config(),
            self.skip_id_arguments(),
        )
    }
}

/// Hash a step's identifying parts into `<class>-<version>-<hash>`.
pub fn compute_unique_id(
    class_name: &str,
    version: Option<&str>,
    config: &serde_json::Value,
    skip: &[&str],
) -> String {
    let mut config = config.clone();
    if let serde_json::Value::Object(map) = &mut config {
        for key in skip {
            map.remove(*key);
        }
    }
    // serde_json::Map keeps keys sorted, so this is canonical.
    let canonical = config.to_string();

    let mut hasher = Sha256::new();
    hasher.update(class_name.as_bytes());
    hasher.update(version.unwrap_or("").as_bytes());
    hasher.update(canonical.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let class = class_name.replace("::", "_");
    match version {
        Some(v) => format!("{class}-{v}-{}", &digest[..32]),
        None => format!("{class}-{}", &digest[..32]),
    }
}

/// Possible states of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// The step has not run yet.
    Incomplete,
    Running,
    Completed,
    /// The step ran, but failed.
    Failed,
}

/// Serializable record of a step, kept by workspaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub unique_id: String,
    pub step_name: Option<String>,
    pub step_class_name: String,
    pub version: Option<String>,
    pub dependencies: BTreeSet<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Where the result lives, a path or URL.
    pub result_location: Option<String>,
}

impl StepInfo {
    /// A fresh record for a step that has not started.
    pub fn for_step(step: &dyn Step, dependency_ids: BTreeSet<String>) -> Self {
        let unique_id = step.unique_id();
        let step_name = (step.name() != unique_id).then(|| step.name().to_string());
        Self {
            unique_id,
            step_name,
            step_class_name: step.class_name().to_string(),
            version: step.version().map(str::to_string),
            dependencies: dependency_ids,
            start_time: None,
            end_time: None,
            error: None,
            result_location: None,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn state(&self) -> StepState {
        match (self.start_time, self.end_time, &self.error) {
            (_, Some(_), Some(_)) => StepState::Failed,
            (Some(_), Some(_), None) => StepState::Completed,
            (Some(_), None, _) => StepState::Running,
            _ => StepState::Incomplete,
        }
    }
}
