//! Burn Dataset Integration for source and target domains
//!
//! Items hold CHW images in `[0, 1]`; the batchers stack them, apply ImageNet
//! normalization and build the label tensors.
//!
//! - `SourceBatcher`: images with identity and camera ids
//! - `TargetBatcher`: two views per image plus K pseudo-label vectors

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use super::batch::{SourceBatch, TargetBatch};
use crate::utils::error::{Result, UdaError};

/// ImageNet channel means
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// A labelled source image
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceItem {
    /// Image data as flattened CHW float array [3 * H * W]
    pub image: Vec<f32>,
    pub identity: usize,
    pub camera: usize,
    pub index: usize,
}

/// A target image with one pseudo-label per granularity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetItem {
    /// Image data as flattened CHW float array [3 * H * W]
    pub image: Vec<f32>,
    pub pseudo_labels: Vec<usize>,
    pub index: usize,
}

/// In-memory dataset of one domain
#[derive(Debug, Clone)]
pub struct DomainDataset<I> {
    items: Vec<I>,
}

impl<I> DomainDataset<I> {
    pub fn new(items: Vec<I>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[I] {
        &self.items
    }
}

impl DomainDataset<SourceItem> {
    /// Number of distinct identities, assuming contiguous ids from zero
    pub fn num_identities(&self) -> usize {
        self.items
            .iter()
            .map(|item| item.identity)
            .max()
            .map(|m| m + 1)
            .unwrap_or(0)
    }
}

impl DomainDataset<TargetItem> {
    /// Replace the pseudo-labels after a new clustering round
    ///
    /// Every label vector must cover the whole dataset; nothing is changed
    /// otherwise.
    pub fn relabel(&mut self, labels: &[Vec<usize>]) -> Result<()> {
        if let Some((k, short)) = labels
            .iter()
            .enumerate()
            .find(|(_, l)| l.len() != self.items.len())
        {
            return Err(UdaError::Dataset(format!(
                "granularity {} has {} labels for {} items",
                k,
                short.len(),
                self.items.len()
            )));
        }

        for (k, per_granularity) in labels.iter().enumerate() {
            for (item, &label) in self.items.iter_mut().zip(per_granularity) {
                if item.pseudo_labels.len() <= k {
                    item.pseudo_labels.resize(k + 1, 0);
                }
                item.pseudo_labels[k] = label;
            }
        }
        let k = labels.len();
        for item in &mut self.items {
            item.pseudo_labels.truncate(k);
        }
        Ok(())
    }
}

impl<I: Clone + Send + Sync> Dataset<I> for DomainDataset<I> {
    fn get(&self, index: usize) -> Option<I> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Batcher for labelled source batches
#[derive(Clone, Debug)]
pub struct SourceBatcher {
    image_size: usize,
}

impl SourceBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, SourceItem, SourceBatch<B>> for SourceBatcher {
    fn batch(&self, items: Vec<SourceItem>, device: &B::Device) -> SourceBatch<B> {
        let batch_size = items.len();
        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.clone()).collect();
        let images = stack_images::<B>(images_data, batch_size, self.image_size, device);

        let identities = int_tensor::<B>(items.iter().map(|item| item.identity), batch_size, device);
        let cameras = int_tensor::<B>(items.iter().map(|item| item.camera), batch_size, device);
        let indices = int_tensor::<B>(items.iter().map(|item| item.index), batch_size, device);

        SourceBatch {
            images,
            identities,
            cameras,
            indices,
        }
    }
}

/// Batcher for pseudo-labelled target batches
///
/// The second view is the horizontal mirror of the first.
#[derive(Clone, Debug)]
pub struct TargetBatcher {
    image_size: usize,
    num_granularities: usize,
}

impl TargetBatcher {
    pub fn new(image_size: usize, num_granularities: usize) -> Self {
        Self {
            image_size,
            num_granularities,
        }
    }
}

impl<B: Backend> Batcher<B, TargetItem, TargetBatch<B>> for TargetBatcher {
    fn batch(&self, items: Vec<TargetItem>, device: &B::Device) -> TargetBatch<B> {
        let batch_size = items.len();
        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.clone()).collect();
        let view_1 = stack_images::<B>(images_data, batch_size, self.image_size, device);
        let view_2 = view_1.clone().flip([3]);

        // Items missing a granularity yield a short vector, which parsing rejects.
        let pseudo_labels = (0..self.num_granularities)
            .map(|k| {
                let labels: Vec<i64> = items
                    .iter()
                    .filter_map(|item| item.pseudo_labels.get(k).map(|&l| l as i64))
                    .collect();
                let n = labels.len();
                Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [n]), device)
            })
            .collect();
        let indices = int_tensor::<B>(items.iter().map(|item| item.index), batch_size, device);

        TargetBatch {
            view_1,
            view_2,
            pseudo_labels,
            indices,
        }
    }
}

fn stack_images<B: Backend>(
    data: Vec<f32>,
    batch_size: usize,
    image_size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let images = Tensor::<B, 4>::from_floats(
        TensorData::new(data, [batch_size, 3, image_size, image_size]),
        device,
    );

    // Apply ImageNet normalization: (x - mean) / std
    let mean = Tensor::<B, 4>::from_floats(TensorData::new(MEAN.to_vec(), [1, 3, 1, 1]), device);
    let std = Tensor::<B, 4>::from_floats(TensorData::new(STD.to_vec(), [1, 3, 1, 1]), device);

    (images - mean) / std
}

fn int_tensor<B: Backend>(
    values: impl Iterator<Item = usize>,
    batch_size: usize,
    device: &B::Device,
) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = values.map(|v| v as i64).collect();
    Tensor::<B, 1, Int>::from_data(TensorData::new(data, [batch_size]), device)
}
