//! Endless batch sources.
//!
//! Trainers pull a fixed number of batches per epoch regardless of dataset
//! size, so the loader wraps around and reshuffles instead of ending.

use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::utils::error::{Result, UdaError};

/// Pull-based supplier of batches
pub trait BatchSource<T> {
    /// Next batch; never signals exhaustion
    fn next_batch(&mut self) -> Result<T>;

    /// Full batches in one pass over the underlying data
    fn batches_per_epoch(&self) -> usize;
}

/// Seeded, shuffling, wrap-around loader over a Burn dataset and batcher
///
/// The trailing partial batch of each pass is dropped.
pub struct IterLoader<B: Backend, I, O> {
    dataset: Arc<dyn Dataset<I>>,
    batcher: Arc<dyn Batcher<B, I, O>>,
    batch_size: usize,
    device: B::Device,
    rng: ChaCha8Rng,
    order: Vec<usize>,
    cursor: usize,
    passes: usize,
}

impl<B: Backend, I, O> IterLoader<B, I, O> {
    pub fn new<D, Bt>(
        dataset: D,
        batcher: Bt,
        batch_size: usize,
        seed: u64,
        device: B::Device,
    ) -> Result<Self>
    where
        D: Dataset<I> + 'static,
        Bt: Batcher<B, I, O> + 'static,
    {
        if batch_size == 0 {
            return Err(UdaError::Config("batch_size must be positive".to_string()));
        }
        if dataset.len() < batch_size {
            return Err(UdaError::Dataset(format!(
                "dataset of {} items cannot fill a batch of {}",
                dataset.len(),
                batch_size
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        order.shuffle(&mut rng);

        Ok(Self {
            dataset: Arc::new(dataset),
            batcher: Arc::new(batcher),
            batch_size,
            device,
            rng,
            order,
            cursor: 0,
            passes: 0,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Completed passes over the dataset
    pub fn passes(&self) -> usize {
        self.passes
    }

    fn reshuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
        self.passes += 1;
        tracing::debug!(passes = self.passes, "loader wrapped around");
    }
}

impl<B: Backend, I, O> BatchSource<O> for IterLoader<B, I, O> {
    fn next_batch(&mut self) -> Result<O> {
        if self.cursor + self.batch_size > self.order.len() {
            self.reshuffle();
        }

        let items = self.order[self.cursor..self.cursor + self.batch_size]
            .iter()
            .map(|&index| {
                self.dataset
                    .get(index)
                    .ok_or_else(|| UdaError::Dataset(format!("missing item {}", index)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.cursor += self.batch_size;

        Ok(self.batcher.batch(items, &self.device))
    }

    fn batches_per_epoch(&self) -> usize {
        self.order.len() / self.batch_size
    }
}
