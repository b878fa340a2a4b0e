//! Model interface and the parameter trees models carry.

use crate::data::dataset::hash_array;
use crate::data::{Array, json::array_from_json};
use crate::error::FlaxError;
use ndarray::{Array1, Array2, ArrayD, Axis, Ix1, Ix2, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Named parameter arrays, ordered by name.
pub type ParamTree = BTreeMap<String, Array>;

/// Parse `{"kernel": [[...]], "bias": [...]}` into a parameter tree.
pub fn params_from_json(value: &Value) -> Result<ParamTree, FlaxError> {
    let object = value
        .as_object()
        .ok_or_else(|| FlaxError::dataset("parameters JSON must be an object of arrays"))?;
    object
        .iter()
        .map(|(name, v)| Ok((name.clone(), array_from_json(v)?)))
        .collect()
}

/// Content hash of a parameter tree, stable across runs.
pub fn params_fingerprint(params: &ParamTree) -> String {
    let mut hasher = Sha256::new();
    for (name, array) in params {
        hash_array(&mut hasher, name, array);
    }
    format!("{:x}", hasher.finalize())
}

/// A model with parameters. The model never owns how it is evaluated; it
/// only maps inputs to outputs under a given parameter tree.
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    fn params(&self) -> &ParamTree;

    fn set_params(&mut self, params: ParamTree);

    /// Forward pass under `params`.
    fn apply(&self, params: &ParamTree, inputs: &Array) -> Result<Array, FlaxError>;

    /// Fresh parameters for inputs of the given shape.
    fn init(&self, seed: u64, input_shape: &[usize]) -> Result<ParamTree, FlaxError>;
}

/// Flatten `[B, ...]` to `[B, features]`.
pub(crate) fn flatten_rows(inputs: &Array) -> Result<Array2<f32>, FlaxError> {
    let rows = *inputs
        .shape()
        .first()
        .ok_or_else(|| FlaxError::shape("inputs need a batch dimension"))?;
    let features: usize = inputs.shape()[1..].iter().product();
    let flat = inputs
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order(vec![rows, features])?;
    Ok(flat.into_dimensionality::<Ix2>()?)
}

fn param<'a>(params: &'a ParamTree, name: &str) -> Result<&'a Array, FlaxError> {
    params
        .get(name)
        .ok_or_else(|| FlaxError::shape(format!("missing parameter '{name}'")))
}

/// Dense layer `y = x · kernel + bias`.
#[derive(Debug, Clone)]
pub struct LinearModel {
    in_features: usize,
    out_features: usize,
    params: ParamTree,
}

impl LinearModel {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            in_features,
            out_features,
            params: ParamTree::new(),
        }
    }

    pub fn with_params(mut self, params: ParamTree) -> Self {
        self.params = params;
        self
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub(crate) fn kernel_and_bias(
        params: &ParamTree,
    ) -> Result<(Array2<f32>, Array1<f32>), FlaxError> {
        let kernel = param(params, "kernel")?.clone().into_dimensionality::<Ix2>()?;
        let bias = param(params, "bias")?.clone().into_dimensionality::<Ix1>()?;
        Ok((kernel, bias))
    }
}

impl Model for LinearModel {
    fn name(&self) -> &str {
        "linear"
    }

    fn params(&self) -> &ParamTree {
        &self.params
    }

    fn set_params(&mut self, params: ParamTree) {
        self.params = params;
    }

    fn apply(&self, params: &ParamTree, inputs: &Array) -> Result<Array, FlaxError> {
        let x = flatten_rows(inputs)?;
        let (kernel, bias) = Self::kernel_and_bias(params)?;
        if x.ncols() != kernel.nrows() || kernel.ncols() != bias.len() {
            return Err(FlaxError::shape(format!(
                "inputs with {} features do not fit kernel {:?} and bias {:?}",
                x.ncols(),
                kernel.shape(),
                bias.shape()
            )));
        }
        let y = x.dot(&kernel) + &bias.insert_axis(Axis(0));
        Ok(y.into_dyn())
    }

    fn init(&self, seed: u64, input_shape: &[usize]) -> Result<ParamTree, FlaxError> {
        let features: usize = input_shape.iter().skip(1).product();
        if features != self.in_features {
            return Err(FlaxError::shape(format!(
                "input shape {input_shape:?} has {features} features, model expects {}",
                self.in_features
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (self.in_features.max(1) as f32).sqrt();
        let kernel: Vec<f32> = (0..self.in_features * self.out_features)
            .map(|_| rng.gen_range(-scale..scale))
            .collect();
        Ok(ParamTree::from([
            (
                "kernel".to_string(),
                ArrayD::from_shape_vec(IxDyn(&[self.in_features, self.out_features]), kernel)?,
            ),
            (
                "bias".to_string(),
                ArrayD::zeros(IxDyn(&[self.out_features])),
            ),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity_params() -> ParamTree {
        params_from_json(&json!({"kernel": [[1, 0], [0, 1]], "bias": [0.5, -0.5]})).unwrap()
    }

    #[test]
    fn test_linear_apply() {
        let model = LinearModel::new(2, 2);
        let x = array_from_json(&json!([[1, 2], [3, 4]])).unwrap();
        let y = model.apply(&identity_params(), &x).unwrap();
        assert_eq!(y.shape(), &[2, 2]);
        assert_eq!(y.as_slice().unwrap(), &[1.5, 1.5, 3.5, 3.5]);
    }

    #[test]
    fn test_linear_flattens_trailing_dims() {
        let model = LinearModel::new(4, 2);
        let params = model.init(0, &[1, 2, 2]).unwrap();
        let x = ArrayD::<f32>::ones(IxDyn(&[3, 2, 2]));
        assert_eq!(model.apply(&params, &x).unwrap().shape(), &[3, 2]);
    }

    #[test]
    fn test_shape_mismatch() {
        let model = LinearModel::new(2, 2);
        let x = ArrayD::<f32>::ones(IxDyn(&[1, 3]));
        assert!(matches!(
            model.apply(&identity_params(), &x),
            Err(FlaxError::Shape(_))
        ));
        assert!(model.init(0, &[1, 3]).is_err());
    }

    #[test]
    fn test_init_deterministic() {
        let model = LinearModel::new(3, 1);
        let a = model.init(7, &[1, 3]).unwrap();
        let b = model.init(7, &[1, 3]).unwrap();
        assert_eq!(params_fingerprint(&a), params_fingerprint(&b));
        assert_eq!(a["bias"].as_slice().unwrap(), &[0.0]);
    }
}
