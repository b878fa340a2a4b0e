//! Built-in components, constructed by key from JSON parameters.
//!
//! Keys are resolved once when a job is assembled; nothing is looked up
//! while the evaluation loop runs.

use crate::callbacks::{
    CallbackContext, CallbackFactory, EvalCallback, LoggingCallback, MetricsFileCallback,
    MetricsFileParams,
};
use crate::eval::EvalWrapper;
use crate::model::{LinearModel, Model};
use crate::train_state::TrainWrapper;
use crate::wrappers::{ClassificationEvalWrapper, MseEvalWrapper, WrapperFields};
use serde::Deserialize;
use std::sync::Arc;
use tango_core::error::RegistryError;
use tango_core::registry::{Registry, parse_params};

#[derive(Debug, Deserialize)]
struct LinearParams {
    in_features: usize,
    #[serde(default = "one")]
    out_features: usize,
}

fn one() -> usize {
    1
}

/// Registries for every kind of component an evaluation job refers to by name.
pub struct FlaxRegistry {
    pub models: Registry<Box<dyn Model>>,
    pub eval_wrappers: Registry<Arc<dyn EvalWrapper>>,
    pub train_wrappers: Registry<Arc<dyn TrainWrapper>>,
    pub callbacks: Registry<CallbackFactory>,
}

impl FlaxRegistry {
    /// Empty registries.
    pub fn new() -> Self {
        Self {
            models: Registry::new("model"),
            eval_wrappers: Registry::new("eval_wrapper"),
            train_wrappers: Registry::new("train_wrapper"),
            callbacks: Registry::new("callback"),
        }
    }

    /// Registries holding the built-in models, wrappers and callbacks.
    pub fn with_builtins() -> Result<Self, RegistryError> {
        let mut registry = Self::new();

        registry.models.register("linear", |params| {
            let p: LinearParams = parse_params("linear", params)?;
            Ok(Box::new(LinearModel::new(p.in_features, p.out_features)) as Box<dyn Model>)
        })?;

        registry.eval_wrappers.register("mse", |params| {
            let fields: WrapperFields = parse_params("mse", params)?;
            Ok(Arc::new(MseEvalWrapper::new(fields)) as Arc<dyn EvalWrapper>)
        })?;
        registry.eval_wrappers.register("classification", |params| {
            let fields: WrapperFields = parse_params("classification", params)?;
            Ok(Arc::new(ClassificationEvalWrapper::new(fields)) as Arc<dyn EvalWrapper>)
        })?;

        registry.train_wrappers.register("mse", |params| {
            let fields: WrapperFields = parse_params("mse", params)?;
            Ok(Arc::new(MseEvalWrapper::new(fields)) as Arc<dyn TrainWrapper>)
        })?;
        registry.train_wrappers.register("classification", |params| {
            let fields: WrapperFields = parse_params("classification", params)?;
            Ok(Arc::new(ClassificationEvalWrapper::new(fields)) as Arc<dyn TrainWrapper>)
        })?;

        registry.callbacks.register("logging", |_params| {
            let factory: CallbackFactory = Arc::new(|ctx: &CallbackContext| {
                Ok(Box::new(LoggingCallback::new(ctx)) as Box<dyn EvalCallback>)
            });
            Ok(factory)
        })?;
        registry.callbacks.register("metrics_file", |params| {
            let p: MetricsFileParams = parse_params("metrics_file", params)?;
            let factory: CallbackFactory = Arc::new(move |ctx: &CallbackContext| {
                Ok(Box::new(MetricsFileCallback::new(ctx, &p)) as Box<dyn EvalCallback>)
            });
            Ok(factory)
        })?;

        Ok(registry)
    }
}

impl Default for FlaxRegistry {
    fn default() -> Self {
        Self::new()
    }
}
