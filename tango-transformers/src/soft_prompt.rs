//! Soft prompts: learnable embeddings prepended to every input sequence.
//!
//! [`SoftPromptModel`] wraps any [`SequenceModel`] and presents the same
//! interface. Inputs are extended with the prompt before the inner forward
//! call, and every sequence-shaped output has the prompt positions removed
//! again, so callers see outputs aligned with their own tokens.

use crate::error::SoftPromptError;
use crate::model::{ForwardInputs, ForwardOutput, KeyValue, LayerOutputs, SequenceModel};
use ndarray::{Array2, Array3, Array4, Axis, concatenate, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tango_core::registry::parse_params;
use tracing::{debug, info, warn};

/// Registered name of the soft-prompt model wrapper.
pub const SOFT_PROMPT_KEY: &str = "transformers::with_soft_prompt";

pub const DEFAULT_PROMPT_SEED: u64 = 1940;

/// Prompt tokens are sampled from the first this many token ids.
const CANDIDATE_TOKENS: usize = 5000;

const PROMPT_PARAMETER: &str = "prompt_embedding";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftPromptConfig {
    /// Number of prompt positions prepended to every sequence.
    pub prompt_length: usize,
    #[serde(default = "default_seed")]
    pub random_seed: u64,
}

fn default_seed() -> u64 {
    DEFAULT_PROMPT_SEED
}

impl SoftPromptConfig {
    pub fn new(prompt_length: usize) -> Self {
        Self {
            prompt_length,
            random_seed: DEFAULT_PROMPT_SEED,
        }
    }

    pub fn from_params(params: &serde_json::Value) -> Result<Self, SoftPromptError> {
        Ok(parse_params(SOFT_PROMPT_KEY, params)?)
    }
}

/// A sequence model with a soft prompt in front of its inputs.
#[derive(Debug, Clone)]
pub struct SoftPromptModel<M> {
    inner: M,
    /// `[1, prompt_length, embedding_dim]`
    prompt: Array3<f32>,
    prompt_name: String,
}

impl<M: SequenceModel> SoftPromptModel<M> {
    /// Wrap `inner`, initialising the prompt from the embeddings of
    /// `prompt_length` distinct token ids drawn with `random_seed`.
    pub fn new(inner: M, config: &SoftPromptConfig) -> Result<Self, SoftPromptError> {
        let prompt_length = config.prompt_length;
        let available = CANDIDATE_TOKENS.min(inner.vocab_size());
        if prompt_length > available {
            return Err(SoftPromptError::PromptTooLong {
                prompt_length,
                available,
            });
        }

        let mut rng = StdRng::seed_from_u64(config.random_seed);
        let ids: Vec<i64> = rand::seq::index::sample(&mut rng, available, prompt_length)
            .into_iter()
            .map(|id| id as i64)
            .collect();
        debug!(?ids, "Sampled prompt tokens");
        let prompt = inner.embed(&Array2::from_shape_vec((1, prompt_length), ids)?)?;
        let expected = [1, prompt_length, inner.embedding_dim()];
        if prompt.shape() != expected {
            return Err(SoftPromptError::shape(format!(
                "embedding returned {:?}, expected {expected:?}",
                prompt.shape()
            )));
        }

        let prompt_name = unique_parameter_name(&inner.parameter_names());
        info!(prompt_length, name = %prompt_name, "Added soft prompt");
        Ok(Self {
            inner,
            prompt,
            prompt_name,
        })
    }

    pub fn prompt_length(&self) -> usize {
        self.prompt.shape()[1]
    }

    pub fn prompt_name(&self) -> &str {
        &self.prompt_name
    }

    pub fn prompt_embedding(&self) -> &Array3<f32> {
        &self.prompt
    }

    /// Replace the prompt, e.g. after an optimisation step. The shape must not change.
    pub fn set_prompt_embedding(&mut self, prompt: Array3<f32>) -> Result<(), SoftPromptError> {
        if prompt.shape() != self.prompt.shape() {
            return Err(SoftPromptError::shape(format!(
                "prompt must keep shape {:?}, got {:?}",
                self.prompt.shape(),
                prompt.shape()
            )));
        }
        self.prompt = prompt;
        Ok(())
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn into_inner(self) -> M {
        self.inner
    }

    fn patch_inputs(&self, mut inputs: ForwardInputs) -> Result<ForwardInputs, SoftPromptError> {
        let p = self.prompt_length();
        let ids = inputs.input_ids.take();
        // Explicit embeddings take precedence over token ids.
        let embeds = match (inputs.inputs_embeds.take(), ids) {
            (Some(embeds), _) => embeds,
            (None, Some(ids)) => self.inner.embed(&ids)?,
            (None, None) => return Err(SoftPromptError::MissingInputs),
        };
        let (batch, dim) = (embeds.shape()[0], embeds.shape()[2]);
        let prompt = self.prompt.broadcast((batch, p, dim)).ok_or_else(|| {
            SoftPromptError::shape(format!(
                "prompt {:?} does not fit embeddings {:?}",
                self.prompt.shape(),
                embeds.shape()
            ))
        })?;
        inputs.inputs_embeds = Some(concatenate(Axis(1), &[prompt, embeds.view()])?);

        inputs.labels = inputs.labels.map(|t| prefix_with(&t, p, 0)).transpose()?;
        inputs.attention_mask = inputs
            .attention_mask
            .map(|t| prefix_with(&t, p, 1))
            .transpose()?;
        inputs.token_type_ids = inputs
            .token_type_ids
            .map(|t| prefix_with(&t, p, 0))
            .transpose()?;
        inputs.position_ids = inputs
            .position_ids
            .map(|t| prefix_positions(&t, p))
            .transpose()?;
        Ok(inputs)
    }

    fn unpatch_output(&self, output: ForwardOutput) -> Result<ForwardOutput, SoftPromptError> {
        let p = self.prompt_length();
        match output {
            ForwardOutput::CausalLm {
                loss,
                logits,
                layers,
                past_key_values,
            } => Ok(ForwardOutput::CausalLm {
                loss,
                logits: strip_sequence(logits, p)?,
                layers: strip_layers(layers, p)?,
                past_key_values,
            }),
            ForwardOutput::BaseModel {
                last_hidden_state,
                layers,
                past_key_values,
            } => Ok(ForwardOutput::BaseModel {
                last_hidden_state: strip_sequence(last_hidden_state, p)?,
                layers: strip_layers(layers, p)?,
                past_key_values: past_key_values
                    .map(|kvs| {
                        kvs.into_iter()
                            .map(|kv| {
                                Ok(KeyValue {
                                    key: strip_heads(kv.key, p)?,
                                    value: strip_heads(kv.value, p)?,
                                })
                            })
                            .collect::<Result<Vec<_>, SoftPromptError>>()
                    })
                    .transpose()?,
            }),
            ForwardOutput::Other { kind, tensors } => {
                warn!(%kind, "Unexpected output kind from the prompted model, passing it through");
                Ok(ForwardOutput::Other { kind, tensors })
            }
        }
    }
}

impl<M: SequenceModel> SequenceModel for SoftPromptModel<M> {
    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn embedding_dim(&self) -> usize {
        self.inner.embedding_dim()
    }

    fn embed(&self, input_ids: &Array2<i64>) -> Result<Array3<f32>, SoftPromptError> {
        self.inner.embed(input_ids)
    }

    fn forward(&self, inputs: ForwardInputs) -> Result<ForwardOutput, SoftPromptError> {
        // With cached keys and values the prompt is already part of the context.
        if inputs.past_key_values.is_some() {
            return self.inner.forward(inputs);
        }
        let patched = self.patch_inputs(inputs)?;
        let output = self.inner.forward(patched)?;
        self.unpatch_output(output)
    }

    fn parameter_names(&self) -> Vec<String> {
        let mut names = self.inner.parameter_names();
        names.push(self.prompt_name.clone());
        names
    }
}

/// First of `prompt_embedding`, `prompt_embedding_1`, ... not in `existing`.
fn unique_parameter_name(existing: &[String]) -> String {
    let mut name = PROMPT_PARAMETER.to_string();
    let mut index = 0;
    while existing.contains(&name) {
        index += 1;
        name = format!("{PROMPT_PARAMETER}_{index}");
    }
    name
}

fn prefix_with(t: &Array2<i64>, p: usize, fill: i64) -> Result<Array2<i64>, SoftPromptError> {
    let prefix = Array2::from_elem((t.nrows(), p), fill);
    Ok(concatenate(Axis(1), &[prefix.view(), t.view()])?)
}

/// `0..p` followed by the original positions shifted by `p`.
fn prefix_positions(t: &Array2<i64>, p: usize) -> Result<Array2<i64>, SoftPromptError> {
    let prefix = Array2::from_shape_fn((t.nrows(), p), |(_, j)| j as i64);
    let shifted = t + p as i64;
    Ok(concatenate(Axis(1), &[prefix.view(), shifted.view()])?)
}

/// Drop the first `p` positions of axis 1.
fn strip_sequence(t: Array3<f32>, p: usize) -> Result<Array3<f32>, SoftPromptError> {
    if t.shape()[1] < p {
        return Err(SoftPromptError::shape(format!(
            "output {:?} is shorter than the {p} prompt positions",
            t.shape()
        )));
    }
    Ok(t.slice_move(s![.., p.., ..]))
}

/// Drop the first `p` positions of axis 2.
fn strip_heads(t: Array4<f32>, p: usize) -> Result<Array4<f32>, SoftPromptError> {
    if t.shape()[2] < p {
        return Err(SoftPromptError::shape(format!(
            "output {:?} is shorter than the {p} prompt positions",
            t.shape()
        )));
    }
    Ok(t.slice_move(s![.., .., p.., ..]))
}

fn strip_layers(layers: LayerOutputs, p: usize) -> Result<LayerOutputs, SoftPromptError> {
    let strip_all_heads = |ts: Vec<Array4<f32>>| {
        ts.into_iter()
            .map(|t| strip_heads(t, p))
            .collect::<Result<Vec<_>, _>>()
    };
    Ok(LayerOutputs {
        hidden_states: layers
            .hidden_states
            .map(|hs| {
                hs.into_iter()
                    .map(|h| strip_sequence(h, p))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?,
        attentions: layers.attentions.map(strip_all_heads).transpose()?,
        cross_attentions: layers.cross_attentions.map(strip_all_heads).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Embedding of token `i` is `[i, 10 * i]`. Logits echo the input embeddings.
    #[derive(Debug)]
    struct Echo {
        vocab: usize,
        params: Vec<String>,
        seen: Mutex<Vec<ForwardInputs>>,
        other_output: bool,
    }

    impl Echo {
        fn new(vocab: usize) -> Self {
            Self {
                vocab,
                params: vec!["wte".into()],
                seen: Mutex::new(Vec::new()),
                other_output: false,
            }
        }

        fn last_inputs(&self) -> ForwardInputs {
            self.seen.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl SequenceModel for Echo {
        fn vocab_size(&self) -> usize {
            self.vocab
        }

        fn embedding_dim(&self) -> usize {
            2
        }

        fn embed(&self, ids: &Array2<i64>) -> Result<Array3<f32>, SoftPromptError> {
            let (b, s) = ids.dim();
            Ok(Array3::from_shape_fn((b, s, 2), |(i, j, d)| {
                ids[[i, j]] as f32 * if d == 0 { 1.0 } else { 10.0 }
            }))
        }

        fn forward(&self, inputs: ForwardInputs) -> Result<ForwardOutput, SoftPromptError> {
            self.seen.lock().unwrap().push(inputs.clone());
            if self.other_output {
                return Ok(ForwardOutput::Other {
                    kind: "seq2seq".into(),
                    tensors: BTreeMap::new(),
                });
            }
            let embeds = match (&inputs.inputs_embeds, &inputs.input_ids) {
                (Some(e), _) => e.clone(),
                (None, Some(ids)) => self.embed(ids)?,
                (None, None) => return Err(SoftPromptError::MissingInputs),
            };
            let (b, s, _) = embeds.dim();
            Ok(ForwardOutput::CausalLm {
                loss: Some(0.5),
                logits: embeds.clone(),
                layers: LayerOutputs {
                    hidden_states: Some(vec![embeds]),
                    attentions: Some(vec![Array4::ones((b, 1, s, s))]),
                    cross_attentions: None,
                },
                past_key_values: None,
            })
        }

        fn parameter_names(&self) -> Vec<String> {
            self.params.clone()
        }
    }

    fn prompted(p: usize) -> SoftPromptModel<Echo> {
        SoftPromptModel::new(Echo::new(100), &SoftPromptConfig::new(p)).unwrap()
    }

    #[test]
    fn test_prompt_from_distinct_token_embeddings() {
        let model = prompted(5);
        let prompt = model.prompt_embedding();
        assert_eq!(prompt.shape(), &[1, 5, 2]);
        let mut ids: Vec<i64> = prompt
            .index_axis(Axis(0), 0)
            .rows()
            .into_iter()
            .map(|row| {
                assert_eq!(row[1], row[0] * 10.0);
                row[0] as i64
            })
            .collect();
        assert!(ids.iter().all(|&id| (0..100).contains(&id)));
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_prompt_is_seeded() {
        assert_eq!(prompted(4).prompt_embedding(), prompted(4).prompt_embedding());
    }

    #[test]
    fn test_prompt_too_long() {
        let err = SoftPromptModel::new(Echo::new(3), &SoftPromptConfig::new(4)).unwrap_err();
        assert!(matches!(
            err,
            SoftPromptError::PromptTooLong {
                prompt_length: 4,
                available: 3
            }
        ));
    }

    #[test]
    fn test_unique_parameter_names() {
        let mut inner = Echo::new(100);
        inner.params.push("prompt_embedding".into());
        let once = SoftPromptModel::new(inner, &SoftPromptConfig::new(1)).unwrap();
        assert_eq!(once.prompt_name(), "prompt_embedding_1");
        let twice = SoftPromptModel::new(once, &SoftPromptConfig::new(1)).unwrap();
        assert_eq!(twice.prompt_name(), "prompt_embedding_2");
    }

    #[test]
    fn test_inputs_are_patched() {
        let model = prompted(2);
        let inputs = ForwardInputs {
            input_ids: Some(array![[1, 2, 3]]),
            attention_mask: Some(array![[1, 1, 0]]),
            token_type_ids: Some(array![[1, 1, 1]]),
            position_ids: Some(array![[0, 1, 2]]),
            labels: Some(array![[5, 6, 7]]),
            ..ForwardInputs::default()
        };
        model.forward(inputs).unwrap();

        let seen = model.inner().last_inputs();
        assert!(seen.input_ids.is_none());
        let embeds = seen.inputs_embeds.unwrap();
        assert_eq!(embeds.shape(), &[1, 5, 2]);
        assert_eq!(
            embeds.slice(s![.., ..2, ..]),
            model.prompt_embedding().view()
        );
        assert_eq!(seen.attention_mask.unwrap(), array![[1i64, 1, 1, 1, 0]]);
        assert_eq!(seen.token_type_ids.unwrap(), array![[0i64, 0, 1, 1, 1]]);
        assert_eq!(seen.position_ids.unwrap(), array![[0i64, 1, 2, 3, 4]]);
        assert_eq!(seen.labels.unwrap(), array![[0i64, 0, 5, 6, 7]]);
    }

    #[test]
    fn test_outputs_are_unpatched() {
        let model = prompted(3);
        let ids = array![[4, 5], [6, 7]];
        let output = model.forward(ForwardInputs::from_ids(ids.clone())).unwrap();
        let ForwardOutput::CausalLm {
            loss,
            logits,
            layers,
            ..
        } = output
        else {
            panic!("expected a causal LM output");
        };
        assert_eq!(loss, Some(0.5));
        assert_eq!(logits, model.inner().embed(&ids).unwrap());
        assert_eq!(layers.hidden_states.unwrap()[0].shape(), &[2, 2, 2]);
        assert_eq!(layers.attentions.unwrap()[0].shape(), &[2, 1, 2, 5]);
    }

    #[test]
    fn test_cached_keys_bypass_prompt() {
        let model = prompted(2);
        let kv = KeyValue {
            key: Array4::zeros((1, 1, 4, 2)),
            value: Array4::zeros((1, 1, 4, 2)),
        };
        let inputs = ForwardInputs {
            input_ids: Some(array![[9]]),
            past_key_values: Some(vec![kv]),
            ..ForwardInputs::default()
        };
        model.forward(inputs.clone()).unwrap();
        assert_eq!(model.inner().last_inputs(), inputs);
    }

    #[test]
    fn test_unknown_output_passes_through() {
        let mut inner = Echo::new(100);
        inner.other_output = true;
        let model = SoftPromptModel::new(inner, &SoftPromptConfig::new(2)).unwrap();
        let out = model.forward(ForwardInputs::from_ids(array![[1]])).unwrap();
        assert!(matches!(out, ForwardOutput::Other { ref kind, .. } if kind == "seq2seq"));
    }

    #[test]
    fn test_missing_inputs() {
        let model = prompted(1);
        assert!(matches!(
            model.forward(ForwardInputs::default()),
            Err(SoftPromptError::MissingInputs)
        ));
    }

    #[test]
    fn test_config_from_params() {
        let config = SoftPromptConfig::from_params(&serde_json::json!({"prompt_length": 8})).unwrap();
        assert_eq!(config, SoftPromptConfig::new(8));
        assert!(SoftPromptConfig::from_params(&serde_json::json!({})).is_err());
    }
}
