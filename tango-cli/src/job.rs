//! Evaluation job files.
//!
//! A job file is a regular Tango config file with an extra `[job]` table
//! naming the components to assemble:
//!
//! ```toml
//! [job]
//! step_name = "evaluation"
//! dataset = "data.json"
//! params = "params.json"
//! model = { type = "linear", in_features = 1 }
//! eval_wrapper = "mse"
//! callbacks = ["logging", { type = "metrics_file", file_name = "final.json" }]
//!
//! [dataloader]
//! batch_size = 4
//! ```

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tango_core::TangoConfig;
use tango_core::registry::parse_params;
use tango_flax::model::params_from_json;
use tango_flax::wrappers::WrapperFields;
use tango_flax::{
    Dataset, DatasetDict, DeviceMesh, FlaxEvalStep, FlaxRegistry, Model, TrainState,
};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct JobFile {
    job: EvalJob,
}

/// The `[job]` table of a job file.
#[derive(Debug, Clone, Deserialize)]
pub struct EvalJob {
    #[serde(default = "default_step_name")]
    pub step_name: String,
    /// Dataset dict JSON, relative to the job file.
    pub dataset: PathBuf,
    /// Parameter tree JSON. Fresh parameters are drawn from `eval.seed` when absent.
    #[serde(default)]
    pub params: Option<PathBuf>,
    pub model: ComponentRef,
    pub eval_wrapper: ComponentRef,
    #[serde(default)]
    pub callbacks: Vec<ComponentRef>,
}

fn default_step_name() -> String {
    "evaluation".to_string()
}

/// A registered component: a bare key, or a table with a `type` key and
/// the component's parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ComponentRef {
    Key(String),
    Table {
        #[serde(rename = "type")]
        kind: String,
        #[serde(flatten)]
        params: BTreeMap<String, Value>,
    },
}

impl ComponentRef {
    pub fn key(&self) -> &str {
        match self {
            Self::Key(key) => key,
            Self::Table { kind, .. } => kind,
        }
    }

    pub fn params(&self) -> Value {
        match self {
            Self::Key(_) => Value::Object(serde_json::Map::new()),
            Self::Table { params, .. } => Value::Object(
                params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        }
    }
}

impl EvalJob {
    /// Read the `[job]` table of a job file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading job file {}", path.display()))?;
        let file: JobFile = toml::from_str(&content)
            .with_context(|| format!("parsing job file {}", path.display()))?;
        Ok(file.job)
    }

    /// Resolve every component and build the evaluation step.
    ///
    /// Relative paths are taken relative to `base_dir`.
    pub fn build_step(
        &self,
        config: &TangoConfig,
        base_dir: &Path,
        registry: &FlaxRegistry,
    ) -> anyhow::Result<FlaxEvalStep> {
        let dataset_path = resolve(base_dir, &self.dataset);
        let dataset = DatasetDict::from_json_file(&dataset_path)
            .with_context(|| format!("loading dataset {}", dataset_path.display()))?;
        debug!(splits = ?dataset.split_names(), "Loaded dataset");

        let model = registry
            .models
            .construct(self.model.key(), &self.model.params())?;
        let wrapper_params = self.eval_wrapper.params();
        let wrapper = registry
            .eval_wrappers
            .construct(self.eval_wrapper.key(), &wrapper_params)?;

        let state = match &self.params {
            Some(path) => {
                let path = resolve(base_dir, path);
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading parameters {}", path.display()))?;
                let value: Value = serde_json::from_str(&content)?;
                TrainState::new(params_from_json(&value)?)
            }
            None => {
                let fields: WrapperFields =
                    parse_params(self.eval_wrapper.key(), &wrapper_params)?;
                initial_state(model.as_ref(), &dataset, config, &fields.input_key)?
            }
        };

        let mut step = FlaxEvalStep::new(
            self.step_name.clone(),
            model,
            state,
            dataset,
            self.eval_wrapper.key(),
            wrapper,
        )
        .with_wrapper_params(wrapper_params)
        .with_settings(config.eval.clone())
        .with_dataloader(config.dataloader.clone())
        .with_mesh(DeviceMesh::from_config(&config.devices)?);

        for callback in &self.callbacks {
            let params = callback.params();
            let factory = registry.callbacks.construct(callback.key(), &params)?;
            step = step.with_callback(callback.key(), params, factory);
        }
        Ok(step)
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Parameters for a model evaluated without a checkpoint: the model's own
/// parameters if it carries any, otherwise a seeded init shaped by the
/// first row of the test split.
fn initial_state(
    model: &dyn Model,
    dataset: &DatasetDict,
    config: &TangoConfig,
    input_key: &str,
) -> anyhow::Result<TrainState> {
    if !model.params().is_empty() {
        return Ok(TrainState::new(model.params().clone()));
    }
    let split = dataset.split(&config.eval.test_split)?;
    let first = split.gather(&[0])?;
    let inputs = first
        .get(input_key)
        .with_context(|| format!("test split has no '{input_key}' column to size parameters"))?;
    info!(
        model = model.name(),
        seed = config.eval.seed,
        "No parameters given, initialising"
    );
    Ok(TrainState::new(model.init(config.eval.seed, inputs.shape())?))
}
