//! # tango-transformers: soft prompts for sequence models
//!
//! [`SoftPromptModel`] adds a learnable prompt in front of every input of a
//! wrapped [`SequenceModel`] and hides it again in the outputs.

pub mod error;
pub mod model;
pub mod soft_prompt;

pub use error::SoftPromptError;
pub use model::{ForwardInputs, ForwardOutput, KeyValue, LayerOutputs, SequenceModel};
pub use soft_prompt::{SoftPromptConfig, SoftPromptModel};
