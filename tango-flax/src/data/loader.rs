//! Batching of datasets into epochs.

use super::{Batch, Dataset};
use crate::device::{DeviceMesh, shard};
use crate::error::FlaxError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tango_core::config::DataLoaderSettings;
use tracing::{debug, warn};

/// Produces one epoch of batches from a dataset.
#[derive(Clone)]
pub struct FlaxDataLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    drop_last: bool,
    shuffle: bool,
}

impl FlaxDataLoader {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        batch_size: usize,
        drop_last: bool,
        shuffle: bool,
    ) -> Result<Self, FlaxError> {
        if batch_size == 0 {
            return Err(FlaxError::configuration("batch_size must be at least 1"));
        }
        Ok(Self {
            dataset,
            batch_size,
            drop_last,
            shuffle,
        })
    }

    pub fn from_settings(
        dataset: Arc<dyn Dataset>,
        settings: &DataLoaderSettings,
    ) -> Result<Self, FlaxError> {
        Self::new(
            dataset,
            settings.batch_size,
            settings.drop_last,
            settings.shuffle,
        )
    }

    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn drop_last(&self) -> bool {
        self.drop_last
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    /// Row count of the underlying dataset.
    pub fn size(&self) -> Result<usize, FlaxError> {
        self.dataset.num_rows().ok_or_else(|| {
            FlaxError::UnsupportedSize("streaming datasets need an explicit step budget".into())
        })
    }

    /// Number of batches one epoch yields.
    pub fn steps_per_epoch(&self) -> Result<usize, FlaxError> {
        let size = self.size()?;
        let partial = !self.drop_last && size % self.batch_size != 0;
        Ok(size / self.batch_size + usize::from(partial))
    }

    /// Row indices of every batch in one epoch.
    ///
    /// Rows are in order when shuffling is off, otherwise a permutation
    /// determined by `seed`. With `drop_last` the remainder that does not
    /// fill a whole batch is dropped.
    pub fn epoch_indices(&self, seed: u64) -> Result<Vec<Vec<usize>>, FlaxError> {
        let size = self.size()?;
        let mut order: Vec<usize> = (0..size).collect();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        if self.drop_last {
            order.truncate(size / self.batch_size * self.batch_size);
        }
        Ok(order.chunks(self.batch_size).map(<[usize]>::to_vec).collect())
    }

    /// Lazily iterate one epoch. With a mesh, every batch is split across
    /// its devices.
    pub fn iter(&self, seed: u64, mesh: Option<&DeviceMesh>) -> Result<BatchIter, FlaxError> {
        let plan = match self.dataset.num_rows() {
            Some(_) => Plan::Groups(self.epoch_indices(seed)?.into_iter()),
            None => {
                if self.shuffle {
                    warn!("Shuffling is not supported on streaming datasets, reading in order");
                }
                Plan::Stream {
                    next_row: 0,
                    batch_size: self.batch_size,
                    exhausted: false,
                }
            }
        };
        Ok(BatchIter {
            dataset: Arc::clone(&self.dataset),
            plan,
            devices: mesh.map(DeviceMesh::len),
        })
    }
}

impl std::fmt::Debug for FlaxDataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlaxDataLoader")
            .field("rows", &self.dataset.num_rows())
            .field("batch_size", &self.batch_size)
            .field("drop_last", &self.drop_last)
            .field("shuffle", &self.shuffle)
            .finish()
    }
}

enum Plan {
    Groups(std::vec::IntoIter<Vec<usize>>),
    Stream {
        next_row: usize,
        batch_size: usize,
        exhausted: bool,
    },
}

/// Iterator over the batches of one epoch.
pub struct BatchIter {
    dataset: Arc<dyn Dataset>,
    plan: Plan,
    devices: Option<usize>,
}

impl Iterator for BatchIter {
    type Item = Result<Batch, FlaxError>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = match &mut self.plan {
            Plan::Groups(groups) => groups.next()?,
            Plan::Stream {
                next_row,
                batch_size,
                exhausted,
            } => {
                if *exhausted {
                    return None;
                }
                let start = *next_row;
                *next_row += *batch_size;
                (start..*next_row).collect::<Vec<_>>()
            }
        };

        let batch = match self.dataset.gather(&indices) {
            Ok(batch) => batch,
            Err(FlaxError::EndOfStream { index }) => {
                if let Plan::Stream { exhausted, .. } = &mut self.plan {
                    debug!(index, "Stream exhausted");
                    *exhausted = true;
                    return None;
                }
                return Some(Err(FlaxError::EndOfStream { index }));
            }
            Err(e) => return Some(Err(e)),
        };

        Some(match self.devices {
            Some(n) => shard(batch, n),
            None => Ok(batch),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Array, ColumnDataset, Example, StreamingDataset};
    use ndarray::{ArrayD, IxDyn};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn indexed(rows: usize) -> Arc<dyn Dataset> {
        let idx = ArrayD::from_shape_vec(IxDyn(&[rows]), (0..rows).map(|v| v as f32).collect())
            .unwrap();
        Arc::new(ColumnDataset::new(BTreeMap::from([("idx".to_string(), idx)])).unwrap())
    }

    fn stream(rows: usize) -> Arc<dyn Dataset> {
        Arc::new(StreamingDataset::new(vec!["idx".into()], move |i| {
            (i < rows).then(|| {
                Example::from([("idx".to_string(), Array::from_elem(IxDyn(&[]), i as f32))])
            })
        }))
    }

    fn collect_indices(loader: &FlaxDataLoader, seed: u64) -> Vec<usize> {
        loader
            .iter(seed, None)
            .unwrap()
            .flat_map(|b| {
                b.unwrap()["idx"]
                    .iter()
                    .map(|v| *v as usize)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(matches!(
            FlaxDataLoader::new(indexed(4), 0, true, false),
            Err(FlaxError::Configuration(_))
        ));
    }

    #[test]
    fn test_steps_per_epoch() {
        let loader = FlaxDataLoader::new(indexed(10), 3, true, false).unwrap();
        assert_eq!(loader.steps_per_epoch().unwrap(), 3);
        let loader = FlaxDataLoader::new(indexed(10), 3, false, false).unwrap();
        assert_eq!(loader.steps_per_epoch().unwrap(), 4);
        assert_eq!(collect_indices(&loader, 0), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_unsized_size() {
        let loader = FlaxDataLoader::new(stream(4), 2, true, false).unwrap();
        assert!(matches!(loader.size(), Err(FlaxError::UnsupportedSize(_))));
    }

    #[test]
    fn test_stream_windows_until_exhausted() {
        let loader = FlaxDataLoader::new(stream(7), 2, true, true).unwrap();
        assert_eq!(collect_indices(&loader, 0), (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_sharded_iteration() {
        let loader = FlaxDataLoader::new(indexed(8), 4, true, false).unwrap();
        let mesh = DeviceMesh::cpu(2);
        let first = loader.iter(0, Some(&mesh)).unwrap().next().unwrap().unwrap();
        assert_eq!(first["idx"].shape(), &[2, 2]);

        let mesh = DeviceMesh::cpu(3);
        let err = loader.iter(0, Some(&mesh)).unwrap().next().unwrap().unwrap_err();
        assert!(matches!(err, FlaxError::Sharding { .. }));
    }

    proptest! {
        #[test]
        fn prop_in_order_without_shuffle(size in 1usize..200, batch in 1usize..32) {
            prop_assume!(size >= batch);
            let loader = FlaxDataLoader::new(indexed(size), batch, true, false).unwrap();
            let expected: Vec<usize> = (0..(size / batch) * batch).collect();
            prop_assert_eq!(collect_indices(&loader, 0), expected);
        }

        #[test]
        fn prop_shuffle_is_seeded_permutation(size in 1usize..200, batch in 1usize..16, seed in any::<u64>()) {
            let loader = FlaxDataLoader::new(indexed(size), batch, false, true).unwrap();
            let first = collect_indices(&loader, seed);
            prop_assert_eq!(&first, &collect_indices(&loader, seed));
            let mut sorted = first;
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..size).collect::<Vec<_>>());
        }
    }
}
