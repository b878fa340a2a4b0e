//! Data engineering: dataset collections, batching and JSON loading.

pub mod dataset;
pub mod json;
pub mod loader;

pub use dataset::{ColumnDataset, Dataset, DatasetDict, RowDataset, StreamingDataset};
pub use json::array_from_json;
pub use loader::{BatchIter, FlaxDataLoader};

use ndarray::ArrayD;
use std::collections::BTreeMap;

/// Every field is converted to `f32` on the way into a batch.
pub type Array = ArrayD<f32>;

/// Named arrays sharing a leading batch dimension.
pub type Batch = BTreeMap<String, Array>;

/// A single row: named arrays without the batch dimension.
pub type Example = BTreeMap<String, Array>;
