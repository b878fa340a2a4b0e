//! Dataset collections that batches are gathered from.

use super::json::array_from_json;
use super::{Array, Batch, Example};
use crate::error::FlaxError;
use ndarray::Axis;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// An indexable collection of examples.
pub trait Dataset: Send + Sync {
    /// Number of rows, or `None` for unsized (streaming) sources.
    fn num_rows(&self) -> Option<usize>;

    /// Gather the given rows into a batch, in the given order.
    fn gather(&self, indices: &[usize]) -> Result<Batch, FlaxError>;

    fn column_names(&self) -> Vec<String>;

    /// Hash of every row's contents, or `None` when the rows cannot be
    /// enumerated up front. Steps over a dataset without a fingerprint are
    /// not cached.
    fn content_fingerprint(&self) -> Option<String> {
        None
    }
}

/// Feed a named array into `hasher`: name, shape, then values in logical order.
pub(crate) fn hash_array(hasher: &mut Sha256, name: &str, array: &Array) {
    hasher.update((name.len() as u64).to_le_bytes());
    hasher.update(name.as_bytes());
    hasher.update((array.ndim() as u64).to_le_bytes());
    for dim in array.shape() {
        hasher.update((*dim as u64).to_le_bytes());
    }
    for v in array.iter() {
        hasher.update(v.to_le_bytes());
    }
}

/// Stack single examples into a batch along a new leading axis.
pub fn stack_examples(examples: &[Example]) -> Result<Batch, FlaxError> {
    let first = examples
        .first()
        .ok_or_else(|| FlaxError::dataset("cannot build a batch from zero examples"))?;
    let mut batch = Batch::new();
    for key in first.keys() {
        let views = examples
            .iter()
            .map(|ex| {
                ex.get(key)
                    .map(|a| a.view())
                    .ok_or_else(|| FlaxError::dataset(format!("example is missing field '{key}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        batch.insert(key.clone(), ndarray::stack(Axis(0), &views)?);
    }
    Ok(batch)
}

fn check_bounds(indices: &[usize], num_rows: usize) -> Result<(), FlaxError> {
    if let Some(bad) = indices.iter().find(|&&i| i >= num_rows) {
        return Err(FlaxError::dataset(format!(
            "row {bad} out of range for dataset with {num_rows} rows"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ColumnDataset
// ---------------------------------------------------------------------------

/// Column-oriented dataset: named arrays with a shared leading dimension.
#[derive(Debug, Clone)]
pub struct ColumnDataset {
    columns: BTreeMap<String, Array>,
    num_rows: usize,
}

impl ColumnDataset {
    pub fn new(columns: BTreeMap<String, Array>) -> Result<Self, FlaxError> {
        let mut num_rows = None;
        for (name, column) in &columns {
            if column.ndim() == 0 {
                return Err(FlaxError::dataset(format!(
                    "column '{name}' has no row dimension"
                )));
            }
            let rows = column.shape()[0];
            match num_rows {
                None => num_rows = Some(rows),
                Some(n) if n != rows => {
                    return Err(FlaxError::dataset(format!(
                        "column '{name}' has {rows} rows, expected {n}"
                    )));
                }
                Some(_) => {}
            }
        }
        let num_rows =
            num_rows.ok_or_else(|| FlaxError::dataset("dataset needs at least one column"))?;
        Ok(Self { columns, num_rows })
    }

    /// Parse `{"x": [[...], ...], "labels": [...], "num_rows": N}`.
    ///
    /// `num_rows` is optional and, when present, must match the columns.
    pub fn from_json(value: &Value) -> Result<Self, FlaxError> {
        let object = value
            .as_object()
            .ok_or_else(|| FlaxError::dataset("dataset JSON must be an object of columns"))?;
        let mut columns = BTreeMap::new();
        let mut declared_rows = None;
        for (name, column) in object {
            if name == "num_rows" {
                declared_rows = column.as_u64().map(|n| n as usize);
                continue;
            }
            columns.insert(name.clone(), array_from_json(column)?);
        }
        let dataset = Self::new(columns)?;
        if let Some(declared) = declared_rows {
            if declared != dataset.num_rows {
                return Err(FlaxError::dataset(format!(
                    "num_rows says {declared} but columns have {} rows",
                    dataset.num_rows
                )));
            }
        }
        Ok(dataset)
    }

    pub fn column(&self, name: &str) -> Option<&Array> {
        self.columns.get(name)
    }
}

impl Dataset for ColumnDataset {
    fn num_rows(&self) -> Option<usize> {
        Some(self.num_rows)
    }

    fn gather(&self, indices: &[usize]) -> Result<Batch, FlaxError> {
        check_bounds(indices, self.num_rows)?;
        Ok(self
            .columns
            .iter()
            .map(|(name, column)| (name.clone(), column.select(Axis(0), indices)))
            .collect())
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    fn content_fingerprint(&self) -> Option<String> {
        let mut hasher = Sha256::new();
        for (name, column) in &self.columns {
            hash_array(&mut hasher, name, column);
        }
        Some(format!("{:x}", hasher.finalize()))
    }
}

// ---------------------------------------------------------------------------
// RowDataset
// ---------------------------------------------------------------------------

/// Row-oriented dataset: one [`Example`] per row.
#[derive(Debug, Clone, Default)]
pub struct RowDataset {
    rows: Vec<Example>,
}

impl RowDataset {
    pub fn new(rows: Vec<Example>) -> Self {
        Self { rows }
    }
}

impl Dataset for RowDataset {
    fn num_rows(&self) -> Option<usize> {
        Some(self.rows.len())
    }

    fn gather(&self, indices: &[usize]) -> Result<Batch, FlaxError> {
        check_bounds(indices, self.rows.len())?;
        let picked: Vec<Example> = indices.iter().map(|&i| self.rows[i].clone()).collect();
        stack_examples(&picked)
    }

    fn column_names(&self) -> Vec<String> {
        self.rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn content_fingerprint(&self) -> Option<String> {
        let mut hasher = Sha256::new();
        hasher.update((self.rows.len() as u64).to_le_bytes());
        for row in &self.rows {
            hasher.update((row.len() as u64).to_le_bytes());
            for (name, field) in row {
                hash_array(&mut hasher, name, field);
            }
        }
        Some(format!("{:x}", hasher.finalize()))
    }
}

// ---------------------------------------------------------------------------
// StreamingDataset
// ---------------------------------------------------------------------------

type Generator = Box<dyn Fn(usize) -> Option<Example> + Send + Sync>;

/// Unsized dataset backed by a generator. Rows are produced on demand;
/// the generator returns `None` once the stream is exhausted.
pub struct StreamingDataset {
    generator: Generator,
    columns: Vec<String>,
}

impl StreamingDataset {
    pub fn new<F>(columns: Vec<String>, generator: F) -> Self
    where
        F: Fn(usize) -> Option<Example> + Send + Sync + 'static,
    {
        Self {
            generator: Box::new(generator),
            columns,
        }
    }
}

impl std::fmt::Debug for StreamingDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingDataset")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

impl Dataset for StreamingDataset {
    fn num_rows(&self) -> Option<usize> {
        None
    }

    fn gather(&self, indices: &[usize]) -> Result<Batch, FlaxError> {
        let rows = indices
            .iter()
            .map(|&i| (self.generator)(i).ok_or(FlaxError::EndOfStream { index: i }))
            .collect::<Result<Vec<_>, _>>()?;
        stack_examples(&rows)
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.clone()
    }
}

// ---------------------------------------------------------------------------
// DatasetDict
// ---------------------------------------------------------------------------

/// Named splits such as `"train"` and `"test"`.
#[derive(Clone, Default)]
pub struct DatasetDict {
    splits: BTreeMap<String, Arc<dyn Dataset>>,
}

impl DatasetDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, split: impl Into<String>, dataset: Arc<dyn Dataset>) {
        self.splits.insert(split.into(), dataset);
    }

    pub fn split(&self, name: &str) -> Result<Arc<dyn Dataset>, FlaxError> {
        self.splits.get(name).cloned().ok_or_else(|| {
            FlaxError::configuration(format!(
                "split '{name}' not found, available: {:?}",
                self.split_names()
            ))
        })
    }

    pub fn split_names(&self) -> Vec<String> {
        self.splits.keys().cloned().collect()
    }

    /// Row counts per split, `None` for unsized splits.
    pub fn row_counts(&self) -> BTreeMap<String, Option<usize>> {
        self.splits
            .iter()
            .map(|(name, ds)| (name.clone(), ds.num_rows()))
            .collect()
    }

    /// Content hash per split, `None` for splits that cannot be hashed.
    pub fn fingerprint(&self) -> BTreeMap<String, Option<String>> {
        self.splits
            .iter()
            .map(|(name, ds)| (name.clone(), ds.content_fingerprint()))
            .collect()
    }

    /// Parse `{"train": {<columns>}, "test": {<columns>}}`.
    pub fn from_json(value: &Value) -> Result<Self, FlaxError> {
        let object = value
            .as_object()
            .ok_or_else(|| FlaxError::dataset("dataset dict JSON must be an object of splits"))?;
        let mut dict = Self::new();
        for (split, columns) in object {
            dict.insert(split.clone(), Arc::new(ColumnDataset::from_json(columns)?));
        }
        Ok(dict)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, FlaxError> {
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        Self::from_json(&value)
    }
}

impl std::fmt::Debug for DatasetDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.row_counts()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use serde_json::json;

    fn scalar(v: f32) -> Array {
        ArrayD::from_elem(IxDyn(&[]), v)
    }

    #[test]
    fn test_column_gather_in_order() {
        let ds = ColumnDataset::from_json(&json!({
            "x": [[0, 0], [1, 1], [2, 2]],
            "labels": [0, 1, 2],
            "num_rows": 3
        }))
        .unwrap();
        assert_eq!(ds.num_rows(), Some(3));
        let batch = ds.gather(&[2, 0]).unwrap();
        assert_eq!(batch["x"].shape(), &[2, 2]);
        assert_eq!(batch["labels"].as_slice().unwrap(), &[2.0, 0.0]);
    }

    #[test]
    fn test_column_misaligned() {
        let err = ColumnDataset::from_json(&json!({"x": [1, 2, 3], "labels": [1, 2]})).unwrap_err();
        assert!(matches!(err, FlaxError::Dataset(_)));
        let err = ColumnDataset::from_json(&json!({"x": [1, 2], "num_rows": 5})).unwrap_err();
        assert!(matches!(err, FlaxError::Dataset(_)));
    }

    #[test]
    fn test_out_of_range() {
        let ds = ColumnDataset::from_json(&json!({"x": [1, 2]})).unwrap();
        assert!(ds.gather(&[2]).is_err());
    }

    #[test]
    fn test_row_dataset_stacks() {
        let rows = (0..4)
            .map(|i| Example::from([("idx".to_string(), scalar(i as f32))]))
            .collect();
        let ds = RowDataset::new(rows);
        let batch = ds.gather(&[3, 1]).unwrap();
        assert_eq!(batch["idx"].as_slice().unwrap(), &[3.0, 1.0]);
        assert_eq!(ds.column_names(), vec!["idx".to_string()]);
    }

    #[test]
    fn test_streaming_end_of_stream() {
        let ds = StreamingDataset::new(vec!["idx".into()], |i| {
            (i < 3).then(|| Example::from([("idx".to_string(), scalar(i as f32))]))
        });
        assert_eq!(ds.num_rows(), None);
        assert!(ds.gather(&[0, 1, 2]).is_ok());
        assert!(matches!(
            ds.gather(&[2, 3]),
            Err(FlaxError::EndOfStream { index: 3 })
        ));
    }

    #[test]
    fn test_dataset_dict_missing_split() {
        let dict = DatasetDict::from_json(&json!({"train": {"x": [1, 2]}})).unwrap();
        assert!(dict.split("train").is_ok());
        assert!(matches!(
            dict.split("test"),
            Err(FlaxError::Configuration(_))
        ));
        assert_eq!(dict.row_counts()["train"], Some(2));
    }

    #[test]
    fn test_fingerprint_follows_contents() {
        let a = DatasetDict::from_json(&json!({"test": {"x": [1, 2], "labels": [1, 3]}})).unwrap();
        let same = DatasetDict::from_json(&json!({"test": {"labels": [1, 3], "x": [1, 2]}})).unwrap();
        let relabelled =
            DatasetDict::from_json(&json!({"test": {"x": [1, 2], "labels": [0, 0]}})).unwrap();
        let renamed = DatasetDict::from_json(&json!({"test": {"x": [1, 2], "y": [1, 3]}})).unwrap();

        assert_eq!(a.fingerprint(), same.fingerprint());
        assert_ne!(a.fingerprint(), relabelled.fingerprint());
        assert_ne!(a.fingerprint(), renamed.fingerprint());
        assert!(a.fingerprint()["test"].is_some());
    }

    #[test]
    fn test_row_dataset_fingerprint() {
        let rows = |v: f32| {
            RowDataset::new(vec![Example::from([("idx".to_string(), scalar(v))])])
                .content_fingerprint()
        };
        assert_eq!(rows(1.0), rows(1.0));
        assert_ne!(rows(1.0), rows(2.0));
    }

    #[test]
    fn test_streaming_has_no_fingerprint() {
        let ds = StreamingDataset::new(vec!["idx".into()], |_| None);
        assert_eq!(ds.content_fingerprint(), None);
    }
}
