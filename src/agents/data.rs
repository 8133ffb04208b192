use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::game::DeviceBatch;

/// Synthetic reference-game data configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub n_objects: usize,
    pub batch_size: usize,
    pub batches_per_epoch: usize,
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            n_objects: 8,
            batch_size: 16,
            batches_per_epoch: 4,
            seed: 7,
        }
    }
}

/// One batch of the reference game: the sender sees the target object, the
/// receiver must name it.
#[derive(Debug, Clone)]
pub struct SymbolBatch<B: Backend> {
    /// One-hot objects, [batch, n_objects].
    pub sender_input: Tensor<B, 2>,
    /// Same objects as one-hot targets, [batch, n_objects].
    pub targets: Tensor<B, 2>,
    pub labels: Vec<usize>,
}

impl<B: Backend> DeviceBatch<B> for SymbolBatch<B> {
    fn to_device(self, device: &B::Device) -> Self {
        SymbolBatch {
            sender_input: self.sender_input.to_device(device),
            targets: self.targets.to_device(device),
            labels: self.labels,
        }
    }
}

/// Row-wise one-hot encoding of `indices` into `width` columns.
pub fn one_hot<B: Backend>(indices: &[usize], width: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0f32; indices.len() * width];
    for (row, &index) in indices.iter().enumerate() {
        values[row * width + index] = 1.0;
    }
    Tensor::from_data(TensorData::new(values, [indices.len(), width]), device)
}

/// Seeded, uniformly drawn object labels grouped into fixed batches.
#[derive(Debug, Clone)]
pub struct SymbolDataset {
    n_objects: usize,
    labels: Vec<Vec<usize>>,
}

impl SymbolDataset {
    pub fn new(config: &DataConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let labels = (0..config.batches_per_epoch)
            .map(|_| {
                (0..config.batch_size)
                    .map(|_| rng.random_range(0..config.n_objects))
                    .collect()
            })
            .collect();
        SymbolDataset {
            n_objects: config.n_objects,
            labels,
        }
    }

    pub fn n_objects(&self) -> usize {
        self.n_objects
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Materialize every batch on `device`.
    pub fn batches<B: Backend>(&self, device: &B::Device) -> Vec<SymbolBatch<B>> {
        self.labels
            .iter()
            .map(|labels| {
                let objects = one_hot(labels, self.n_objects, device);
                SymbolBatch {
                    sender_input: objects.clone(),
                    targets: objects,
                    labels: labels.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_one_hot() {
        let device = Default::default();
        let t = one_hot::<TestBackend>(&[2, 0], 3, &device);
        let values = t.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_dataset_is_seeded() {
        let config = DataConfig::default();
        let a = SymbolDataset::new(&config);
        let b = SymbolDataset::new(&config);
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.len(), config.batches_per_epoch);

        let other = SymbolDataset::new(&DataConfig {
            seed: config.seed + 1,
            ..config.clone()
        });
        assert_ne!(a.labels, other.labels);
    }

    #[test]
    fn test_batches_shapes() {
        let device = Default::default();
        let config = DataConfig {
            n_objects: 5,
            batch_size: 3,
            batches_per_epoch: 2,
            seed: 1,
        };
        let batches = SymbolDataset::new(&config).batches::<TestBackend>(&device);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].sender_input.dims(), [3, 5]);
        assert_eq!(batches[0].labels.len(), 3);
        assert!(batches[0].labels.iter().all(|&l| l < 5));
    }
}
