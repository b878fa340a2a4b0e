//! Error types for the tango-transformers crate.

use tango_core::error::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SoftPromptError {
    #[error("Prompt length {prompt_length} exceeds the {available} candidate tokens")]
    PromptTooLong {
        prompt_length: usize,
        available: usize,
    },

    #[error("Shape error: {0}")]
    Shape(String),

    /// Neither token ids nor embeddings were given.
    #[error("Forward call has no input_ids or inputs_embeds")]
    MissingInputs,

    #[error("Model error: {0}")]
    Model(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl SoftPromptError {
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }
}

impl From<ndarray::ShapeError> for SoftPromptError {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::Shape(e.to_string())
    }
}
