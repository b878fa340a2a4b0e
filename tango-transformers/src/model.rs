//! Sequence-model interface: token embeddings plus a keyword-style forward call.

use crate::error::SoftPromptError;
use ndarray::{Array2, Array3, Array4, ArrayD};
use std::collections::BTreeMap;

/// Cached attention keys and values of one layer, `[batch, heads, seq, head_dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: Array4<f32>,
    pub value: Array4<f32>,
}

/// Arguments of a forward call. Sequence tensors are `[batch, seq, ...]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardInputs {
    pub input_ids: Option<Array2<i64>>,
    pub inputs_embeds: Option<Array3<f32>>,
    pub attention_mask: Option<Array2<i64>>,
    pub token_type_ids: Option<Array2<i64>>,
    pub position_ids: Option<Array2<i64>>,
    pub labels: Option<Array2<i64>>,
    pub past_key_values: Option<Vec<KeyValue>>,
}

impl ForwardInputs {
    pub fn from_ids(input_ids: Array2<i64>) -> Self {
        Self {
            input_ids: Some(input_ids),
            ..Self::default()
        }
    }
}

/// Optional per-layer tensors shared by every output kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerOutputs {
    /// `[batch, seq, hidden]` per layer.
    pub hidden_states: Option<Vec<Array3<f32>>>,
    /// `[batch, heads, query, key]` per layer.
    pub attentions: Option<Vec<Array4<f32>>>,
    pub cross_attentions: Option<Vec<Array4<f32>>>,
}

/// Result of a forward call.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOutput {
    /// Language-model head output.
    CausalLm {
        loss: Option<f32>,
        /// `[batch, seq, vocab]`
        logits: Array3<f32>,
        layers: LayerOutputs,
        past_key_values: Option<Vec<KeyValue>>,
    },
    /// Bare encoder/decoder output.
    BaseModel {
        /// `[batch, seq, hidden]`
        last_hidden_state: Array3<f32>,
        layers: LayerOutputs,
        past_key_values: Option<Vec<KeyValue>>,
    },
    /// Anything else, identified by `kind`.
    Other {
        kind: String,
        tensors: BTreeMap<String, ArrayD<f32>>,
    },
}

/// A transformer-style model over token sequences.
pub trait SequenceModel: Send + Sync {
    fn vocab_size(&self) -> usize;

    fn embedding_dim(&self) -> usize;

    /// Look up input embeddings: `[batch, seq]` ids to `[batch, seq, dim]`.
    fn embed(&self, input_ids: &Array2<i64>) -> Result<Array3<f32>, SoftPromptError>;

    fn forward(&self, inputs: ForwardInputs) -> Result<ForwardOutput, SoftPromptError>;

    /// Names of all parameters the model holds.
    fn parameter_names(&self) -> Vec<String>;
}
