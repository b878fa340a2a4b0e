//! Error types for the tango-flax crate.

use tango_core::error::{RegistryError, StepError, TangoError};
use thiserror::Error;

/// Top-level error type for data loading, evaluation and training.
#[derive(Debug, Error)]
pub enum FlaxError {
    /// The requested run can never be satisfied as configured.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Dataset does not expose a row count: {0}")]
    UnsupportedSize(String),

    #[error("Batch size {batch_size} is not divisible by the {devices} available devices")]
    Sharding { batch_size: usize, devices: usize },

    #[error("Dataset error: {0}")]
    Dataset(String),

    /// A streaming dataset ran out of examples.
    #[error("End of stream at row {index}")]
    EndOfStream { index: usize },

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Callback '{name}' failed: {message}")]
    Callback { name: String, message: String },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl FlaxError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn callback(name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Callback {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Wrap as a core error attributed to the named step.
    pub fn into_step_error(self, step_name: &str) -> TangoError {
        StepError::failed(step_name, self).into()
    }
}

impl From<ndarray::ShapeError> for FlaxError {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::Shape(e.to_string())
    }
}
