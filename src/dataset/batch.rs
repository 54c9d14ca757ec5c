//! Batch layouts consumed by the trainers and their parsing rules.

use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::utils::error::{Result, UdaError};

/// Labelled source-domain batch
///
/// `cameras` rides along for evaluation tooling; training never reads it.
#[derive(Clone, Debug)]
pub struct SourceBatch<B: Backend> {
    /// Images with shape [batch_size, channels, height, width]
    pub images: Tensor<B, 4>,
    /// Ground-truth identity per image
    pub identities: Tensor<B, 1, Int>,
    pub cameras: Tensor<B, 1, Int>,
    /// Position of each sample in its dataset
    pub indices: Tensor<B, 1, Int>,
}

impl<B: Backend> SourceBatch<B> {
    /// Images and identities, after checking their sizes agree
    pub fn into_inputs(self) -> Result<(Tensor<B, 4>, Tensor<B, 1, Int>)> {
        let batch_size = self.images.dims()[0];
        if batch_size == 0 {
            return Err(UdaError::ShapeMismatch("empty image batch".to_string()));
        }
        let [num_labels] = self.identities.dims();
        if num_labels != batch_size {
            return Err(UdaError::ShapeMismatch(format!(
                "{} identities for {} images",
                num_labels, batch_size
            )));
        }
        Ok((self.images, self.identities))
    }
}

/// Pseudo-labelled target-domain batch with two views of every image
#[derive(Clone, Debug)]
pub struct TargetBatch<B: Backend> {
    pub view_1: Tensor<B, 4>,
    pub view_2: Tensor<B, 4>,
    /// One label vector per granularity, in bank order
    pub pseudo_labels: Vec<Tensor<B, 1, Int>>,
    pub indices: Tensor<B, 1, Int>,
}

/// Parsed target inputs
#[derive(Clone, Debug)]
pub struct TargetInputs<B: Backend> {
    pub view_1: Tensor<B, 4>,
    pub view_2: Tensor<B, 4>,
    pub labels: Vec<Tensor<B, 1, Int>>,
}

impl<B: Backend> TargetBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.view_1.dims()[0]
    }

    /// Validate against a bank of `num_granularities` heads
    pub fn into_inputs(self, num_granularities: usize) -> Result<TargetInputs<B>> {
        if self.pseudo_labels.len() != num_granularities {
            return Err(UdaError::Config(format!(
                "batch carries {} pseudo-label sets, expected {}",
                self.pseudo_labels.len(),
                num_granularities
            )));
        }

        let batch_size = self.batch_size();
        if batch_size == 0 {
            return Err(UdaError::ShapeMismatch("empty image batch".to_string()));
        }
        if self.view_2.dims() != self.view_1.dims() {
            return Err(UdaError::ShapeMismatch(format!(
                "views differ: {:?} vs {:?}",
                self.view_1.dims(),
                self.view_2.dims()
            )));
        }
        for (k, labels) in self.pseudo_labels.iter().enumerate() {
            let [n] = labels.dims();
            if n != batch_size {
                return Err(UdaError::ShapeMismatch(format!(
                    "granularity {} has {} labels for {} images",
                    k, n, batch_size
                )));
            }
        }

        Ok(TargetInputs {
            view_1: self.view_1,
            view_2: self.view_2,
            labels: self.pseudo_labels,
        })
    }
}

/// Random permutation of a batch and its inverse, for shuffled batch-norm
///
/// `x.select(0, forward).select(0, backward) == x`.
pub fn shuffle_ids<B: Backend, R: Rng>(
    batch_size: usize,
    rng: &mut R,
    device: &B::Device,
) -> (Tensor<B, 1, Int>, Tensor<B, 1, Int>) {
    let mut forward: Vec<usize> = (0..batch_size).collect();
    forward.shuffle(rng);

    let mut backward = vec![0i64; batch_size];
    for (position, &index) in forward.iter().enumerate() {
        backward[index] = position as i64;
    }
    let forward: Vec<i64> = forward.into_iter().map(|i| i as i64).collect();

    (
        Tensor::from_data(TensorData::new(forward, [batch_size]), device),
        Tensor::from_data(TensorData::new(backward, [batch_size]), device),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray<f32>;

    fn ints(values: Vec<i64>) -> Tensor<TestBackend, 1, Int> {
        let n = values.len();
        Tensor::from_data(TensorData::new(values, [n]), &Default::default())
    }

    fn target_batch(n: usize, labels: Vec<Vec<i64>>) -> TargetBatch<TestBackend> {
        let device = Default::default();
        TargetBatch {
            view_1: Tensor::zeros([n, 3, 4, 4], &device),
            view_2: Tensor::zeros([n, 3, 4, 4], &device),
            pseudo_labels: labels.into_iter().map(ints).collect(),
            indices: ints((0..n as i64).collect()),
        }
    }

    #[test]
    fn test_source_label_count_must_match() {
        let batch = SourceBatch::<TestBackend> {
            images: Tensor::zeros([3, 3, 4, 4], &Default::default()),
            identities: ints(vec![0, 1]),
            cameras: ints(vec![0, 0, 1]),
            indices: ints(vec![0, 1, 2]),
        };
        assert!(matches!(
            batch.into_inputs().unwrap_err(),
            UdaError::ShapeMismatch(_)
        ));
    }

    #[test]
    fn test_target_requires_one_label_set_per_head() {
        let batch = target_batch(2, vec![vec![0, 1]]);
        assert!(matches!(
            batch.into_inputs(2).unwrap_err(),
            UdaError::Config(_)
        ));

        let batch = target_batch(2, vec![vec![0, 1], vec![1]]);
        assert!(matches!(
            batch.into_inputs(2).unwrap_err(),
            UdaError::ShapeMismatch(_)
        ));

        let batch = target_batch(2, vec![vec![0, 1], vec![1, 1]]);
        assert_eq!(batch.into_inputs(2).unwrap().labels.len(), 2);
    }

    #[test]
    fn test_shuffle_ids_invert_each_other() {
        let device = Default::default();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let (forward, backward) = shuffle_ids::<TestBackend, _>(6, &mut rng, &device);

        let x = ints(vec![10, 11, 12, 13, 14, 15]);
        let restored: Vec<i64> = x
            .clone()
            .select(0, forward)
            .select(0, backward)
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(restored, vec![10, 11, 12, 13, 14, 15]);
    }
}
