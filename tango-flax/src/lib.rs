//! # tango-flax: data loading, evaluation and train state
//!
//! Components for evaluating (and training) array models as Tango steps:
//! - [`data`]: datasets, dataset dicts and the [`FlaxDataLoader`]
//! - [`device`] and [`parallel`]: device meshes, sharding, `pmap` and all-reduce
//! - [`metrics::MetricAggregator`]: running averages of per-step metrics
//! - [`callbacks`]: hooks around the evaluation loop
//! - [`eval::FlaxEvalStep`]: the evaluation loop, runnable as a [`tango_core::Step`]
//! - [`train_state`]: parameters, optimizers and data-parallel train steps

pub mod callbacks;
pub mod data;
pub mod device;
pub mod error;
pub mod eval;
pub mod metrics;
pub mod model;
pub mod parallel;
pub mod registry;
pub mod train_state;
pub mod wrappers;

pub use callbacks::{CallbackContext, CallbackFactory, CallbackHookSet, EvalCallback};
pub use data::{Batch, Dataset, DatasetDict, FlaxDataLoader};
pub use device::DeviceMesh;
pub use error::FlaxError;
pub use eval::{EvalWrapper, FlaxEvalStep};
pub use metrics::MetricAggregator;
pub use model::{LinearModel, Model, ParamTree};
pub use registry::FlaxRegistry;
pub use train_state::{FlaxTrainState, Optimizer, Sgd, TrainState, TrainWrapper};
pub use wrappers::{ClassificationEvalWrapper, MseEvalWrapper};

/// Scalar metrics by name.
pub type Metrics = std::collections::BTreeMap<String, f64>;
