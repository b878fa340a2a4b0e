//! Evaluation loop: batches from the data loader, optionally replicated
//! across devices, folded into running metrics with callbacks around it.

use crate::Metrics;
use crate::callbacks::{CallbackContext, CallbackFactory, CallbackHookSet};
use crate::data::{Array, Batch, Dataset, DatasetDict, FlaxDataLoader};
use crate::device::{DeviceMesh, device_slices};
use crate::error::FlaxError;
use crate::metrics::{MetricAggregator, format_metrics};
use crate::model::{Model, params_fingerprint};
use crate::parallel::{AllReduce, pmap};
use crate::train_state::TrainState;
use ndarray::Axis;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tango_core::config::{DataLoaderSettings, EvalSettings};
use tango_core::error::TangoError;
use tango_core::step::{Step, StepContext};
use tracing::{debug, info, warn};

/// User-supplied evaluation logic: predictions and metrics for one batch.
pub trait EvalWrapper: Send + Sync {
    fn eval_fn(
        &self,
        state: &TrainState,
        batch: &Batch,
        model: &dyn Model,
    ) -> Result<(Array, Metrics), FlaxError>;
}

/// Evaluates a model on one split of a dataset.
pub struct FlaxEvalStep {
    name: String,
    model_name: String,
    model: Mutex<Box<dyn Model>>,
    state: TrainState,
    dataset: DatasetDict,
    dataloader: DataLoaderSettings,
    wrapper_key: String,
    wrapper_params: Value,
    wrapper: Arc<dyn EvalWrapper>,
    settings: EvalSettings,
    mesh: DeviceMesh,
    callbacks: Vec<(String, Value, CallbackFactory)>,
}

impl FlaxEvalStep {
    pub const CLASS_NAME: &'static str = "flax::eval";
    pub const VERSION: &'static str = "002";

    /// Evaluate `model` under `state`. The wrapper key names the wrapper in
    /// the step's identity.
    pub fn new(
        name: impl Into<String>,
        model: Box<dyn Model>,
        state: TrainState,
        dataset: DatasetDict,
        wrapper_key: impl Into<String>,
        wrapper: Arc<dyn EvalWrapper>,
    ) -> Self {
        Self {
            name: name.into(),
            model_name: model.name().to_string(),
            model: Mutex::new(model),
            state,
            dataset,
            dataloader: DataLoaderSettings::default(),
            wrapper_key: wrapper_key.into(),
            wrapper_params: json!({}),
            wrapper,
            settings: EvalSettings::default(),
            mesh: DeviceMesh::detect(),
            callbacks: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: EvalSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_dataloader(mut self, dataloader: DataLoaderSettings) -> Self {
        self.dataloader = dataloader;
        self
    }

    pub fn with_mesh(mut self, mesh: DeviceMesh) -> Self {
        self.mesh = mesh;
        self
    }

    /// Parameters the wrapper was constructed from. They are part of the
    /// step's identity.
    pub fn with_wrapper_params(mut self, params: Value) -> Self {
        self.wrapper_params = params;
        self
    }

    /// Add a callback constructed under `key` from `params`; callbacks run
    /// in the order they were added.
    pub fn with_callback(
        mut self,
        key: impl Into<String>,
        params: Value,
        factory: CallbackFactory,
    ) -> Self {
        self.callbacks.push((key.into(), params, factory));
        self
    }

    pub fn settings(&self) -> &EvalSettings {
        &self.settings
    }

    /// Number of batches a run evaluates.
    pub fn resolve_steps(&self, loader: &FlaxDataLoader) -> Result<usize, FlaxError> {
        match loader.steps_per_epoch() {
            Ok(per_epoch) => Ok(self
                .settings
                .eval_steps
                .map_or(per_epoch, |budget| per_epoch.min(budget))),
            Err(FlaxError::UnsupportedSize(_)) => self.settings.eval_steps.ok_or_else(|| {
                FlaxError::configuration(
                    "the evaluation dataset has no size, so eval_steps must be set",
                )
            }),
            Err(e) => Err(e),
        }
    }

    /// Run the evaluation loop and return the final aggregate.
    pub fn evaluate(&self, step_id: &str, work_dir: &Path) -> Result<Metrics, FlaxError> {
        let settings = &self.settings;
        settings
            .validate()
            .map_err(|e| FlaxError::configuration(e.to_string()))?;

        let dataset = self.dataset.split(&settings.test_split)?;
        let loader = FlaxDataLoader::from_settings(dataset, &self.dataloader)?;
        let steps = self.resolve_steps(&loader)?;

        let mesh = if settings.distributed {
            if self.mesh.len() <= 1 {
                return Err(FlaxError::configuration(
                    "distributed evaluation requested but there is only one device",
                ));
            }
            Some(&self.mesh)
        } else {
            None
        };

        let mut guard = self
            .model
            .lock()
            .map_err(|_| FlaxError::evaluation("model lock poisoned by an earlier panic"))?;
        guard.set_params(self.state.params.clone());
        let model: &dyn Model = &**guard;

        let context = CallbackContext {
            step_id: step_id.to_string(),
            work_dir: work_dir.to_path_buf(),
            model_name: self.model_name.clone(),
            dataset_rows: loader.dataset().num_rows(),
            batch_size: loader.batch_size(),
        };
        let factories: Vec<CallbackFactory> =
            self.callbacks.iter().map(|(_, _, f)| Arc::clone(f)).collect();
        let mut hooks = CallbackHookSet::construct(&factories, &context)?;

        info!(
            step_id,
            steps,
            distributed = mesh.is_some(),
            callbacks = hooks.len(),
            "Starting evaluation"
        );
        hooks.pre_eval_loop()?;

        let mut aggregator = MetricAggregator::new(settings.metric_names.iter().cloned());
        let mut aggregated = Metrics::new();
        let mut batches = loader.iter(settings.seed, mesh)?;
        let mut evaluated = 0;

        for step in 0..steps {
            let Some(batch) = batches.next() else {
                warn!(step, steps, "Data ran out before the step budget was reached");
                break;
            };
            let batch = batch?;

            hooks.pre_batch(step, &batch)?;
            let (predictions, metrics) = match mesh {
                None => self.wrapper.eval_fn(&self.state, &batch, model)?,
                Some(_) => self.eval_distributed(&batch, model)?,
            };
            debug!(step, metrics = %format_metrics(&metrics), "Evaluated batch");
            hooks.post_batch(step, &predictions)?;

            if settings.auto_aggregate {
                aggregator.update(&metrics);
                aggregated = aggregator.snapshot();
            } else {
                aggregated = metrics;
            }
            evaluated = step + 1;

            if reports_progress(step, steps, settings.log_every) {
                info!(
                    step,
                    total = steps,
                    metrics = %format_metrics(&aggregated),
                    "Evaluating"
                );
            }
        }

        // A stream that ended early never reached the final step's report.
        if evaluated > 0 && !reports_progress(evaluated - 1, steps, settings.log_every) {
            info!(
                step = evaluated - 1,
                total = steps,
                metrics = %format_metrics(&aggregated),
                "Evaluating"
            );
        }

        hooks.post_eval_loop(&aggregated)?;
        Ok(aggregated)
    }

    /// Run the wrapper on every device shard and average the metrics.
    fn eval_distributed(
        &self,
        batch: &Batch,
        model: &dyn Model,
    ) -> Result<(Array, Metrics), FlaxError> {
        let shards = device_slices(batch)?;
        let wrapper = self.wrapper.as_ref();
        let state = &self.state;
        let outputs = pmap(&shards, |_, shard| wrapper.eval_fn(state, shard, model))?;
        let (predictions, metrics): (Vec<Array>, Vec<Metrics>) = outputs.into_iter().unzip();

        let views: Vec<_> = predictions.iter().map(|p| p.view()).collect();
        let predictions = ndarray::concatenate(Axis(0), &views)?;
        Ok((predictions, AllReduce::mean().reduce_metrics(&metrics)?))
    }
}

/// Whether step `step` of `steps` gets a progress line.
fn reports_progress(step: usize, steps: usize, log_every: usize) -> bool {
    step % log_every == 0 || step + 1 == steps
}

impl Step for FlaxEvalStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &str {
        Self::CLASS_NAME
    }

    fn config(&self) -> Value {
        let callbacks: Vec<Value> = self
            .callbacks
            .iter()
            .map(|(key, params, _)| json!({"type": key, "params": params}))
            .collect();
        json!({
            "model": self.model_name,
            "params": params_fingerprint(&self.state.params),
            "dataset": self.dataset.fingerprint(),
            "eval_wrapper": {"type": self.wrapper_key, "params": self.wrapper_params},
            "dataloader": self.dataloader,
            "test_split": self.settings.test_split,
            "seed": self.settings.seed,
            "log_every": self.settings.log_every,
            "distributed": self.settings.distributed,
            "eval_steps": self.settings.eval_steps,
            "metric_names": self.settings.metric_names,
            "auto_aggregate": self.settings.auto_aggregate,
            "callbacks": callbacks,
        })
    }

    fn skip_id_arguments(&self) -> &[&str] {
        &["log_every"]
    }

    fn version(&self) -> Option<&str> {
        Some(Self::VERSION)
    }

    /// Results are only reused when the evaluated split can be hashed.
    fn cacheable(&self) -> bool {
        self.dataset
            .split(&self.settings.test_split)
            .ok()
            .and_then(|ds| ds.content_fingerprint())
            .is_some()
    }

    fn run(&self, ctx: &StepContext) -> Result<Value, TangoError> {
        let metrics = self
            .evaluate(&ctx.unique_id, &ctx.work_dir)
            .map_err(|e| e.into_step_error(&self.name))?;
        Ok(json!(metrics))
    }
}

impl std::fmt::Debug for FlaxEvalStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlaxEvalStep")
            .field("name", &self.name)
            .field("model", &self.model_name)
            .field("eval_wrapper", &self.wrapper_key)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
