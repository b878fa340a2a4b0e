//! Reference eval/train wrappers for regression and classification.
//!
//! Gradients are analytic and only defined for [`LinearModel`](crate::model::LinearModel).

use crate::Metrics;
use crate::data::{Array, Batch};
use crate::error::FlaxError;
use crate::eval::EvalWrapper;
use crate::model::{Model, ParamTree, flatten_rows};
use crate::train_state::{LossOutput, TrainState, TrainWrapper};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// Batch fields a wrapper reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapperFields {
    #[serde(default = "default_input_key")]
    pub input_key: String,
    #[serde(default = "default_label_key")]
    pub label_key: String,
}

impl Default for WrapperFields {
    fn default() -> Self {
        Self {
            input_key: default_input_key(),
            label_key: default_label_key(),
        }
    }
}

fn default_input_key() -> String {
    "x".to_string()
}

fn default_label_key() -> String {
    "labels".to_string()
}

impl WrapperFields {
    fn field<'a>(batch: &'a Batch, key: &str) -> Result<&'a Array, FlaxError> {
        batch
            .get(key)
            .ok_or_else(|| FlaxError::dataset(format!("batch has no field '{key}'")))
    }

    fn inputs<'a>(&self, batch: &'a Batch) -> Result<&'a Array, FlaxError> {
        Self::field(batch, &self.input_key)
    }

    fn labels<'a>(&self, batch: &'a Batch) -> Result<&'a Array, FlaxError> {
        Self::field(batch, &self.label_key)
    }
}

fn require_linear(model: &dyn Model) -> Result<(), FlaxError> {
    if model.name() != "linear" {
        return Err(FlaxError::training(format!(
            "analytic gradients are only available for the linear model, got '{}'",
            model.name()
        )));
    }
    Ok(())
}

/// Gradients of a linear layer given d(loss)/d(outputs).
fn linear_grads(inputs: &Array, grad_out: &Array2<f32>) -> Result<ParamTree, FlaxError> {
    let x = flatten_rows(inputs)?;
    Ok(ParamTree::from([
        ("kernel".to_string(), x.t().dot(grad_out).into_dyn()),
        ("bias".to_string(), grad_out.sum_axis(Axis(0)).into_dyn()),
    ]))
}

// ---------------------------------------------------------------------------
// Mean squared error
// ---------------------------------------------------------------------------

/// Regression against `labels` with mean squared error as `loss`.
#[derive(Debug, Clone, Default)]
pub struct MseEvalWrapper {
    fields: WrapperFields,
}

impl MseEvalWrapper {
    pub fn new(fields: WrapperFields) -> Self {
        Self { fields }
    }

    /// Labels laid out like `predictions`.
    fn aligned_labels(predictions: &Array, labels: &Array) -> Result<Array2<f32>, FlaxError> {
        if predictions.len() != labels.len() {
            return Err(FlaxError::shape(format!(
                "predictions {:?} and labels {:?} have different sizes",
                predictions.shape(),
                labels.shape()
            )));
        }
        let predictions = flatten_rows(predictions)?;
        Ok(Array2::from_shape_vec(
            predictions.raw_dim(),
            labels.iter().copied().collect(),
        )?)
    }

    fn mse(predictions: &Array, labels: &Array) -> Result<f64, FlaxError> {
        let labels = Self::aligned_labels(predictions, labels)?;
        let n = labels.len().max(1) as f64;
        let total: f64 = predictions
            .iter()
            .zip(labels.iter())
            .map(|(p, y)| f64::from(p - y).powi(2))
            .sum();
        Ok(total / n)
    }
}

impl EvalWrapper for MseEvalWrapper {
    fn eval_fn(
        &self,
        state: &TrainState,
        batch: &Batch,
        model: &dyn Model,
    ) -> Result<(Array, Metrics), FlaxError> {
        let predictions = model.apply(&state.params, self.fields.inputs(batch)?)?;
        let metrics = self.compute_metrics(&predictions, batch)?;
        Ok((predictions, metrics))
    }
}

impl TrainWrapper for MseEvalWrapper {
    fn loss_and_grads(
        &self,
        model: &dyn Model,
        params: &ParamTree,
        batch: &Batch,
    ) -> Result<LossOutput, FlaxError> {
        require_linear(model)?;
        let inputs = self.fields.inputs(batch)?;
        let labels = self.fields.labels(batch)?;
        let predictions = model.apply(params, inputs)?;
        let loss = Self::mse(&predictions, labels)?;

        let diff = flatten_rows(&predictions)? - Self::aligned_labels(&predictions, labels)?;
        let grad_out = diff * (2.0 / predictions.len().max(1) as f32);
        Ok(LossOutput {
            loss,
            grads: linear_grads(inputs, &grad_out)?,
            predictions,
        })
    }

    fn compute_metrics(&self, predictions: &Array, batch: &Batch) -> Result<Metrics, FlaxError> {
        let loss = Self::mse(predictions, self.fields.labels(batch)?)?;
        Ok(Metrics::from([("loss".to_string(), loss)]))
    }

    fn predict(
        &self,
        model: &dyn Model,
        params: &ParamTree,
        batch: &Batch,
    ) -> Result<Array, FlaxError> {
        model.apply(params, self.fields.inputs(batch)?)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classification from logits `[B, C]` against integer class `labels`.
/// Reports softmax cross-entropy as `loss` and `accuracy`.
#[derive(Debug, Clone, Default)]
pub struct ClassificationEvalWrapper {
    fields: WrapperFields,
}

impl ClassificationEvalWrapper {
    pub fn new(fields: WrapperFields) -> Self {
        Self { fields }
    }

    fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
        let mut out = logits.clone();
        for mut row in out.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
            row.mapv_inplace(|v| v - max - log_sum);
        }
        out
    }

    fn classes(labels: &Array, rows: usize, num_classes: usize) -> Result<Vec<usize>, FlaxError> {
        if labels.len() != rows {
            return Err(FlaxError::shape(format!(
                "expected {rows} labels, got {}",
                labels.len()
            )));
        }
        labels
            .iter()
            .map(|&v| {
                if v < 0.0 || v.fract() != 0.0 || v as usize >= num_classes {
                    Err(FlaxError::dataset(format!(
                        "label {v} is not a class id below {num_classes}"
                    )))
                } else {
                    Ok(v as usize)
                }
            })
            .collect()
    }

    fn argmax(row: ndarray::ArrayView1<'_, f32>) -> usize {
        row.iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                if v > best.1 { (i, v) } else { best }
            })
            .0
    }

    /// Log-probabilities, class ids and metrics for one batch of logits.
    fn score(
        &self,
        logits: &Array,
        batch: &Batch,
    ) -> Result<(Array2<f32>, Vec<usize>, Metrics), FlaxError> {
        let logits = flatten_rows(logits)?;
        let classes = Self::classes(self.fields.labels(batch)?, logits.nrows(), logits.ncols())?;
        let log_probs = Self::log_softmax(&logits);
        let rows = classes.len().max(1) as f64;

        let nll: f64 = classes
            .iter()
            .enumerate()
            .map(|(i, &c)| -f64::from(log_probs[[i, c]]))
            .sum();
        let correct = classes
            .iter()
            .enumerate()
            .filter(|&(i, &c)| Self::argmax(log_probs.row(i)) == c)
            .count();

        let metrics = Metrics::from([
            ("loss".to_string(), nll / rows),
            ("accuracy".to_string(), correct as f64 / rows),
        ]);
        Ok((log_probs, classes, metrics))
    }
}

impl EvalWrapper for ClassificationEvalWrapper {
    fn eval_fn(
        &self,
        state: &TrainState,
        batch: &Batch,
        model: &dyn Model,
    ) -> Result<(Array, Metrics), FlaxError> {
        let logits = model.apply(&state.params, self.fields.inputs(batch)?)?;
        let (_, _, metrics) = self.score(&logits, batch)?;
        Ok((logits, metrics))
    }
}

impl TrainWrapper for ClassificationEvalWrapper {
    fn loss_and_grads(
        &self,
        model: &dyn Model,
        params: &ParamTree,
        batch: &Batch,
    ) -> Result<LossOutput, FlaxError> {
        require_linear(model)?;
        let inputs = self.fields.inputs(batch)?;
        let logits = model.apply(params, inputs)?;
        let (log_probs, classes, metrics) = self.score(&logits, batch)?;

        // d(mean NLL)/d(logits) = (softmax - one_hot) / B
        let mut grad_out = log_probs.mapv(f32::exp);
        for (i, &c) in classes.iter().enumerate() {
            grad_out[[i, c]] -= 1.0;
        }
        grad_out /= classes.len().max(1) as f32;

        Ok(LossOutput {
            loss: metrics.get("loss").copied().unwrap_or_default(),
            grads: linear_grads(inputs, &grad_out)?,
            predictions: logits,
        })
    }

    fn compute_metrics(&self, predictions: &Array, batch: &Batch) -> Result<Metrics, FlaxError> {
        self.score(predictions, batch).map(|(_, _, metrics)| metrics)
    }

    fn predict(
        &self,
        model: &dyn Model,
        params: &ParamTree,
        batch: &Batch,
    ) -> Result<Array, FlaxError> {
        model.apply(params, self.fields.inputs(batch)?)
    }
}
