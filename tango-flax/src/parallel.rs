//! Data-parallel execution: run a function once per device shard and
//! combine the per-device results with an all-reduce.
//!
//! Star topology: every device's values are gathered on the host, reduced,
//! and the single reduced value is what every device "sees".

use crate::data::Batch;
use crate::error::FlaxError;
use crate::model::ParamTree;
use crate::Metrics;
use serde::{Deserialize, Serialize};

/// Reduction operation for allreduce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Mean,
}

/// Combines values computed independently on each device.
#[derive(Clone, Copy, Debug)]
pub struct AllReduce {
    op: ReduceOp,
}

impl AllReduce {
    pub fn new(op: ReduceOp) -> Self {
        Self { op }
    }

    pub fn mean() -> Self {
        Self::new(ReduceOp::Mean)
    }

    pub fn sum() -> Self {
        Self::new(ReduceOp::Sum)
    }

    /// Reduce per-device metric maps element-wise.
    ///
    /// Every device must report the same metric names.
    pub fn reduce_metrics(&self, per_device: &[Metrics]) -> Result<Metrics, FlaxError> {
        let Some(first) = per_device.first() else {
            return Ok(Metrics::new());
        };
        let n = per_device.len() as f64;
        let mut result = Metrics::new();
        for name in first.keys() {
            let mut total = 0.0;
            for (device, metrics) in per_device.iter().enumerate() {
                let v = metrics.get(name).ok_or_else(|| {
                    FlaxError::evaluation(format!("device {device} did not report metric '{name}'"))
                })?;
                total += v;
            }
            let value = match self.op {
                ReduceOp::Sum => total,
                ReduceOp::Mean => total / n,
            };
            result.insert(name.clone(), value);
        }
        if per_device.iter().any(|m| m.len() != first.len()) {
            return Err(FlaxError::evaluation(
                "devices reported different sets of metrics",
            ));
        }
        Ok(result)
    }

    /// Reduce per-device parameter trees (e.g. gradients) element-wise.
    pub fn reduce_trees(&self, per_device: &[ParamTree]) -> Result<ParamTree, FlaxError> {
        let Some(first) = per_device.first() else {
            return Ok(ParamTree::new());
        };
        let n = per_device.len() as f32;
        let mut result = ParamTree::new();
        for (name, value) in first {
            let mut total = value.clone();
            for (device, tree) in per_device.iter().enumerate().skip(1) {
                let other = tree.get(name).ok_or_else(|| {
                    FlaxError::training(format!("device {device} has no entry for '{name}'"))
                })?;
                if other.shape() != total.shape() {
                    return Err(FlaxError::shape(format!(
                        "'{name}' has shape {:?} on device {device}, expected {:?}",
                        other.shape(),
                        total.shape()
                    )));
                }
                total += other;
            }
            if self.op == ReduceOp::Mean {
                total.mapv_inplace(|v| v / n);
            }
            result.insert(name.clone(), total);
        }
        Ok(result)
    }
}

/// Run `f` once per device shard, concurrently, and collect the results in
/// device order.
///
/// Blocks until every device finished; the first error (in device order)
/// aborts the step.
pub fn pmap<T, F>(shards: &[Batch], f: F) -> Result<Vec<T>, FlaxError>
where
    T: Send,
    F: Fn(usize, &Batch) -> Result<T, FlaxError> + Sync,
{
    let f = &f;
    std::thread::scope(|scope| {
        let handles: Vec<_> = shards
            .iter()
            .enumerate()
            .map(|(device, shard)| scope.spawn(move || f(device, shard)))
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(device, handle)| {
                handle.join().unwrap_or_else(|_| {
                    Err(FlaxError::evaluation(format!("device {device} panicked")))
                })
            })
            .collect()
    })
}
