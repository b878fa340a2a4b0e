//! Compute devices and per-device sharding of batches.

use crate::data::{Array, Batch};
use crate::error::FlaxError;
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use tango_core::config::DeviceConfig;
use tracing::debug;

/// Kind of compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Cpu,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: usize,
    pub kind: DeviceKind,
}

/// The set of devices a data-parallel computation is replicated across.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMesh {
    devices: Vec<Device>,
}

impl DeviceMesh {
    /// One CPU device per available hardware thread.
    pub fn detect() -> Self {
        let count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::cpu(count)
    }

    /// A mesh of `count` CPU devices (at least one).
    pub fn cpu(count: usize) -> Self {
        let devices = (0..count.max(1))
            .map(|id| Device {
                id,
                kind: DeviceKind::Cpu,
            })
            .collect();
        Self { devices }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self, FlaxError> {
        match config.count {
            Some(0) => Err(FlaxError::configuration("devices.count must be at least 1")),
            Some(n) => Ok(Self::cpu(n)),
            None => Ok(Self::detect()),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Split every field's leading dimension across the devices in this mesh.
    pub fn shard(&self, batch: Batch) -> Result<Batch, FlaxError> {
        shard(batch, self.len())
    }
}

/// Reshape each field from `[B, ...]` to `[n, B / n, ...]`.
pub fn shard(batch: Batch, n: usize) -> Result<Batch, FlaxError> {
    batch
        .into_iter()
        .map(|(name, field)| {
            let batch_size = field
                .shape()
                .first()
                .copied()
                .ok_or_else(|| FlaxError::shape(format!("field '{name}' has no batch dimension")))?;
            if n == 0 || batch_size % n != 0 {
                return Err(FlaxError::Sharding {
                    batch_size,
                    devices: n,
                });
            }
            let mut shape = vec![n, batch_size / n];
            shape.extend_from_slice(&field.shape()[1..]);
            let field = field.as_standard_layout().into_owned();
            Ok((name, field.into_shape_with_order(shape)?))
        })
        .collect()
}

/// Inverse of [`shard`]: merge `[n, b, ...]` back into `[n * b, ...]`.
pub fn unshard(batch: Batch) -> Result<Batch, FlaxError> {
    batch
        .into_iter()
        .map(|(name, field)| Ok((name, unshard_array(field)?)))
        .collect()
}

pub fn unshard_array(field: Array) -> Result<Array, FlaxError> {
    if field.ndim() < 2 {
        return Err(FlaxError::shape(
            "sharded array needs device and batch dimensions",
        ));
    }
    let mut shape = vec![field.shape()[0] * field.shape()[1]];
    shape.extend_from_slice(&field.shape()[2..]);
    let field = field.as_standard_layout().into_owned();
    Ok(field.into_shape_with_order(shape)?)
}

/// Split a sharded batch into one batch per device.
pub fn device_slices(batch: &Batch) -> Result<Vec<Batch>, FlaxError> {
    let devices = batch
        .values()
        .next()
        .and_then(|f| f.shape().first().copied())
        .ok_or_else(|| FlaxError::shape("cannot slice an empty batch across devices"))?;
    if batch.values().any(|f| f.shape().first() != Some(&devices)) {
        return Err(FlaxError::shape("fields disagree on the device dimension"));
    }
    debug!(devices, "Slicing sharded batch");
    Ok((0..devices)
        .map(|d| {
            batch
                .iter()
                .map(|(name, field)| (name.clone(), field.index_axis(Axis(0), d).to_owned()))
                .collect()
        })
        .collect())
}
