//! Conversion of nested JSON numbers into dense arrays.

use super::Array;
use crate::error::FlaxError;
use ndarray::{ArrayD, IxDyn};
use serde_json::Value;

/// Build an array from nested JSON lists of numbers (or booleans).
///
/// `[[1, 2], [3, 4]]` becomes a `[2, 2]` array; a bare number becomes a
/// zero-dimensional array. Ragged nesting is rejected.
pub fn array_from_json(value: &Value) -> Result<Array, FlaxError> {
    let shape = infer_shape(value);
    let mut data = Vec::with_capacity(shape.iter().product());
    flatten(value, 0, &shape, &mut data)?;
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
}

fn infer_shape(value: &Value) -> Vec<usize> {
    let mut shape = Vec::new();
    let mut current = value;
    while let Value::Array(items) = current {
        shape.push(items.len());
        match items.first() {
            Some(first) => current = first,
            None => break,
        }
    }
    shape
}

fn flatten(value: &Value, depth: usize, shape: &[usize], out: &mut Vec<f32>) -> Result<(), FlaxError> {
    match value {
        Value::Array(items) => {
            if depth >= shape.len() || items.len() != shape[depth] {
                return Err(FlaxError::shape(format!(
                    "ragged nested list at depth {depth}"
                )));
            }
            for item in items {
                flatten(item, depth + 1, shape, out)?;
            }
            Ok(())
        }
        Value::Number(n) if depth == shape.len() => {
            let v = n
                .as_f64()
                .ok_or_else(|| FlaxError::dataset(format!("number {n} is not representable")))?;
            out.push(v as f32);
            Ok(())
        }
        Value::Bool(b) if depth == shape.len() => {
            out.push(if *b { 1.0 } else { 0.0 });
            Ok(())
        }
        Value::Number(_) | Value::Bool(_) => Err(FlaxError::shape(format!(
            "ragged nested list at depth {depth}"
        ))),
        other => Err(FlaxError::dataset(format!(
            "expected numbers or lists, found {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matrix() {
        let arr = array_from_json(&json!([[1, 2, 3], [4, 5, 6]])).unwrap();
        assert_eq!(arr.shape(), &[2, 3]);
        assert_eq!(arr[[1, 2]], 6.0);
    }

    #[test]
    fn test_scalar_and_bool() {
        let arr = array_from_json(&json!(2.5)).unwrap();
        assert_eq!(arr.ndim(), 0);
        let arr = array_from_json(&json!([true, false])).unwrap();
        assert_eq!(arr.as_slice().unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn test_empty_list() {
        let arr = array_from_json(&json!([])).unwrap();
        assert_eq!(arr.shape(), &[0]);
    }

    #[test]
    fn test_ragged_rejected() {
        assert!(matches!(
            array_from_json(&json!([[1, 2], [3]])),
            Err(FlaxError::Shape(_))
        ));
        assert!(matches!(
            array_from_json(&json!([1, [2]])),
            Err(FlaxError::Shape(_))
        ));
    }

    #[test]
    fn test_strings_rejected() {
        assert!(matches!(
            array_from_json(&json!(["a"])),
            Err(FlaxError::Dataset(_))
        ));
    }
}
