//! Train state: parameters plus step counter, updated from externally computed gradients.
//!
//! Gradient computation belongs to the [`TrainWrapper`]; this module only
//! owns how gradients are averaged across devices and applied.

use crate::Metrics;
use crate::data::{Array, Batch};
use crate::device::{DeviceMesh, device_slices};
use crate::error::FlaxError;
use crate::model::{Model, ParamTree};
use crate::parallel::{AllReduce, pmap};
use std::sync::Arc;
use tracing::debug;

/// Parameters and the number of updates applied to them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainState {
    pub params: ParamTree,
    pub step: u64,
}

impl TrainState {
    pub fn new(params: ParamTree) -> Self {
        Self { params, step: 0 }
    }

    pub fn apply_gradients(
        &mut self,
        grads: &ParamTree,
        optimizer: &mut dyn Optimizer,
    ) -> Result<(), FlaxError> {
        optimizer.update(&mut self.params, grads)?;
        self.step += 1;
        Ok(())
    }

    /// One copy of the state per device.
    pub fn replicate(&self, devices: usize) -> Vec<TrainState> {
        vec![self.clone(); devices.max(1)]
    }

    /// Collapse replicas back into a single state. Replicas are identical
    /// after synchronized updates, so the first one wins.
    pub fn unreplicate(replicas: Vec<TrainState>) -> Result<TrainState, FlaxError> {
        replicas
            .into_iter()
            .next()
            .ok_or_else(|| FlaxError::training("cannot unreplicate zero replicas"))
    }
}

/// Applies gradients to parameters.
pub trait Optimizer: Send + Sync {
    fn update(&mut self, params: &mut ParamTree, grads: &ParamTree) -> Result<(), FlaxError>;

    fn learning_rate(&self) -> f32;
}

/// Stochastic gradient descent with optional momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    pub learning_rate: f32,
    pub momentum: f32,
    velocity: ParamTree,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            velocity: ParamTree::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, params: &mut ParamTree, grads: &ParamTree) -> Result<(), FlaxError> {
        for (name, param) in params.iter_mut() {
            // Parameters without a gradient are frozen.
            let Some(grad) = grads.get(name) else {
                continue;
            };
            if grad.shape() != param.shape() {
                return Err(FlaxError::shape(format!(
                    "gradient for '{name}' has shape {:?}, parameter has {:?}",
                    grad.shape(),
                    param.shape()
                )));
            }
            let step = if self.momentum > 0.0 {
                let velocity = self
                    .velocity
                    .entry(name.clone())
                    .or_insert_with(|| Array::zeros(grad.raw_dim()));
                *velocity *= self.momentum;
                *velocity += grad;
                velocity.clone()
            } else {
                grad.clone()
            };
            param.scaled_add(-self.learning_rate, &step);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

/// Loss, predictions and gradients for one batch.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f64,
    pub predictions: Array,
    pub grads: ParamTree,
}

/// User-supplied training logic.
pub trait TrainWrapper: Send + Sync {
    fn loss_and_grads(
        &self,
        model: &dyn Model,
        params: &ParamTree,
        batch: &Batch,
    ) -> Result<LossOutput, FlaxError>;

    fn compute_metrics(&self, predictions: &Array, batch: &Batch) -> Result<Metrics, FlaxError>;

    /// Predictions for validation.
    fn predict(
        &self,
        model: &dyn Model,
        params: &ParamTree,
        batch: &Batch,
    ) -> Result<Array, FlaxError>;
}

/// Couples a model, optimizer and train wrapper with the current train state.
pub struct FlaxTrainState {
    model: Box<dyn Model>,
    optimizer: Box<dyn Optimizer>,
    wrapper: Arc<dyn TrainWrapper>,
    mesh: Option<DeviceMesh>,
    state: TrainState,
}

impl FlaxTrainState {
    /// Build the initial state from the model's own parameters, or from a
    /// fresh initialisation for inputs of `input_shape` when it has none.
    ///
    /// Passing a mesh turns on data-parallel updates.
    pub fn new(
        model: Box<dyn Model>,
        optimizer: Box<dyn Optimizer>,
        wrapper: Arc<dyn TrainWrapper>,
        mesh: Option<DeviceMesh>,
        input_shape: Option<&[usize]>,
    ) -> Result<Self, FlaxError> {
        if let Some(mesh) = &mesh {
            if mesh.len() <= 1 {
                return Err(FlaxError::configuration(
                    "distributed training requested but there is only one device",
                ));
            }
        }
        let params = if !model.params().is_empty() {
            model.params().clone()
        } else {
            let shape = input_shape.ok_or_else(|| {
                FlaxError::configuration("model has no parameters and no input shape was given")
            })?;
            model.init(0, shape)?
        };
        Ok(Self {
            model,
            optimizer,
            wrapper,
            mesh,
            state: TrainState::new(params),
        })
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn is_distributed(&self) -> bool {
        self.mesh.is_some()
    }

    /// One optimisation step. Returns `loss` plus the wrapper's metrics,
    /// averaged across devices when distributed.
    pub fn train_step(&mut self, batch: &Batch) -> Result<Metrics, FlaxError> {
        let model = self.model.as_ref();
        let wrapper = self.wrapper.as_ref();
        let params = &self.state.params;

        let (grads, metrics) = match &self.mesh {
            None => local_train_step(model, wrapper, params, batch)?,
            Some(mesh) => {
                let shards = device_slices(&mesh.shard(batch.clone())?)?;
                let outputs = pmap(&shards, |_, shard| {
                    local_train_step(model, wrapper, params, shard)
                })?;
                let (grads, metrics): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();
                let reduce = AllReduce::mean();
                (reduce.reduce_trees(&grads)?, reduce.reduce_metrics(&metrics)?)
            }
        };

        self.state
            .apply_gradients(&grads, self.optimizer.as_mut())?;
        debug!(step = self.state.step, "Applied gradients");
        Ok(metrics)
    }

    /// Metrics on a validation batch; parameters are not touched.
    pub fn val_step(&self, batch: &Batch) -> Result<Metrics, FlaxError> {
        let model = self.model.as_ref();
        let wrapper = self.wrapper.as_ref();
        let params = &self.state.params;

        match &self.mesh {
            None => local_val_step(model, wrapper, params, batch),
            Some(mesh) => {
                let shards = device_slices(&mesh.shard(batch.clone())?)?;
                let metrics = pmap(&shards, |_, shard| {
                    local_val_step(model, wrapper, params, shard)
                })?;
                AllReduce::mean().reduce_metrics(&metrics)
            }
        }
    }

    /// Hand the trained parameters back to the model and return it.
    pub fn into_model(mut self) -> Box<dyn Model> {
        self.model.set_params(self.state.params);
        self.model
    }
}

fn local_train_step(
    model: &dyn Model,
    wrapper: &dyn TrainWrapper,
    params: &ParamTree,
    batch: &Batch,
) -> Result<(ParamTree, Metrics), FlaxError> {
    let out = wrapper.loss_and_grads(model, params, batch)?;
    let mut metrics = Metrics::from([("loss".to_string(), out.loss)]);
    metrics.extend(wrapper.compute_metrics(&out.predictions, batch)?);
    Ok((out.grads, metrics))
}

fn local_val_step(
    model: &dyn Model,
    wrapper: &dyn TrainWrapper,
    params: &ParamTree,
    batch: &Batch,
) -> Result<Metrics, FlaxError> {
    let predictions = wrapper.predict(model, params, batch)?;
    wrapper.compute_metrics(&predictions, batch)
}
