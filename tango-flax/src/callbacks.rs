//! Evaluation callbacks: lifecycle hooks around the evaluation loop.

use crate::Metrics;
use crate::data::{Array, Batch};
use crate::error::FlaxError;
use crate::metrics::format_metrics;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// What a callback knows about the run it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackContext {
    pub step_id: String,
    pub work_dir: PathBuf,
    pub model_name: String,
    /// Rows in the evaluated split; `None` for streaming datasets.
    pub dataset_rows: Option<usize>,
    pub batch_size: usize,
}

/// Hooks invoked by the evaluation loop. Every hook defaults to a no-op;
/// an error aborts the loop.
pub trait EvalCallback: Send {
    fn name(&self) -> &str;

    fn pre_eval_loop(&mut self) -> Result<(), FlaxError> {
        Ok(())
    }

    fn pre_batch(&mut self, _step: usize, _batch: &Batch) -> Result<(), FlaxError> {
        Ok(())
    }

    fn post_batch(&mut self, _step: usize, _predictions: &Array) -> Result<(), FlaxError> {
        Ok(())
    }

    fn post_eval_loop(&mut self, _aggregated: &Metrics) -> Result<(), FlaxError> {
        Ok(())
    }
}

/// Builds a callback bound to one run.
pub type CallbackFactory =
    Arc<dyn Fn(&CallbackContext) -> Result<Box<dyn EvalCallback>, FlaxError> + Send + Sync>;

/// Callbacks of one run, invoked in registration order.
#[derive(Default)]
pub struct CallbackHookSet {
    callbacks: Vec<Box<dyn EvalCallback>>,
}

impl CallbackHookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate every factory against `context`, keeping their order.
    pub fn construct(
        factories: &[CallbackFactory],
        context: &CallbackContext,
    ) -> Result<Self, FlaxError> {
        let callbacks = factories
            .iter()
            .map(|factory| factory(context))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { callbacks })
    }

    pub fn push(&mut self, callback: Box<dyn EvalCallback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.callbacks.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn pre_eval_loop(&mut self) -> Result<(), FlaxError> {
        self.each(|cb| cb.pre_eval_loop())
    }

    pub fn pre_batch(&mut self, step: usize, batch: &Batch) -> Result<(), FlaxError> {
        self.each(|cb| cb.pre_batch(step, batch))
    }

    pub fn post_batch(&mut self, step: usize, predictions: &Array) -> Result<(), FlaxError> {
        self.each(|cb| cb.post_batch(step, predictions))
    }

    pub fn post_eval_loop(&mut self, aggregated: &Metrics) -> Result<(), FlaxError> {
        self.each(|cb| cb.post_eval_loop(aggregated))
    }

    fn each<F>(&mut self, mut hook: F) -> Result<(), FlaxError>
    where
        F: FnMut(&mut dyn EvalCallback) -> Result<(), FlaxError>,
    {
        for callback in &mut self.callbacks {
            hook(callback.as_mut()).map_err(|e| match e {
                e @ FlaxError::Callback { .. } => e,
                other => FlaxError::callback(callback.name(), other),
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CallbackHookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Traces every hook.
#[derive(Debug, Clone)]
pub struct LoggingCallback {
    step_id: String,
}

impl LoggingCallback {
    pub fn new(context: &CallbackContext) -> Self {
        Self {
            step_id: context.step_id.clone(),
        }
    }
}

impl EvalCallback for LoggingCallback {
    fn name(&self) -> &str {
        "logging"
    }

    fn pre_eval_loop(&mut self) -> Result<(), FlaxError> {
        info!(step_id = %self.step_id, "Evaluation starting");
        Ok(())
    }

    fn pre_batch(&mut self, step: usize, batch: &Batch) -> Result<(), FlaxError> {
        let rows = batch.values().next().and_then(|f| f.shape().first().copied());
        debug!(step, rows, "Batch ready");
        Ok(())
    }

    fn post_batch(&mut self, step: usize, predictions: &Array) -> Result<(), FlaxError> {
        debug!(step, shape = ?predictions.shape(), "Batch evaluated");
        Ok(())
    }

    fn post_eval_loop(&mut self, aggregated: &Metrics) -> Result<(), FlaxError> {
        info!(
            step_id = %self.step_id,
            metrics = %format_metrics(aggregated),
            "Evaluation finished"
        );
        Ok(())
    }
}

/// Parameters of [`MetricsFileCallback`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsFileParams {
    #[serde(default = "default_metrics_file")]
    pub file_name: String,
}

impl Default for MetricsFileParams {
    fn default() -> Self {
        Self {
            file_name: default_metrics_file(),
        }
    }
}

fn default_metrics_file() -> String {
    "metrics.json".to_string()
}

/// Writes the final aggregate into the step's work directory.
#[derive(Debug, Clone)]
pub struct MetricsFileCallback {
    path: PathBuf,
}

impl MetricsFileCallback {
    pub fn new(context: &CallbackContext, params: &MetricsFileParams) -> Self {
        Self {
            path: context.work_dir.join(&params.file_name),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl EvalCallback for MetricsFileCallback {
    fn name(&self) -> &str {
        "metrics_file"
    }

    fn post_eval_loop(&mut self, aggregated: &Metrics) -> Result<(), FlaxError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(aggregated)?)?;
        info!(path = %self.path.display(), "Wrote metrics");
        Ok(())
    }
}
