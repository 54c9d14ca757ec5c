//! Seeded synthetic domains for smoke runs and tests.
//!
//! Every identity gets a random prototype image; samples are noisy copies of
//! it. The target domain is the same construction under a brightness shift,
//! and its pseudo-labels come from [`coarsen_labels`] instead of a real
//! clustering pass.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::burn_dataset::{DomainDataset, SourceItem, TargetItem};
use crate::utils::error::{Result, UdaError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticDomainConfig {
    pub num_identities: usize,
    pub samples_per_identity: usize,
    pub num_cameras: usize,
    /// Side length of the square images
    pub image_size: usize,
    /// Half-width of the uniform per-pixel noise
    pub noise: f32,
    /// Brightness offset added to every pixel
    pub domain_shift: f32,
    pub seed: u64,
}

impl Default for SyntheticDomainConfig {
    fn default() -> Self {
        Self {
            num_identities: 16,
            samples_per_identity: 4,
            num_cameras: 2,
            image_size: 16,
            noise: 0.1,
            domain_shift: 0.0,
            seed: 42,
        }
    }
}

impl SyntheticDomainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_identities == 0 || self.samples_per_identity == 0 {
            return Err(UdaError::Config(
                "synthetic domain needs at least one identity and one sample".to_string(),
            ));
        }
        if self.num_cameras == 0 {
            return Err(UdaError::Config("num_cameras must be positive".to_string()));
        }
        if self.image_size < 8 {
            return Err(UdaError::Config(format!(
                "image_size {} is below the minimum of 8",
                self.image_size
            )));
        }
        if self.noise < 0.0 {
            return Err(UdaError::Config("noise must be non-negative".to_string()));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.num_identities * self.samples_per_identity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Sample {
    image: Vec<f32>,
    identity: usize,
    camera: usize,
    index: usize,
}

fn generate(config: &SyntheticDomainConfig) -> Result<Vec<Sample>> {
    config.validate()?;

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let pixels = 3 * config.image_size * config.image_size;

    let prototypes: Vec<Vec<f32>> = (0..config.num_identities)
        .map(|_| (0..pixels).map(|_| rng.gen::<f32>()).collect())
        .collect();

    let mut samples = Vec::with_capacity(config.len());
    for (identity, prototype) in prototypes.iter().enumerate() {
        for k in 0..config.samples_per_identity {
            let image = prototype
                .iter()
                .map(|&p| {
                    let jitter = rng.gen_range(-1.0f32..=1.0) * config.noise;
                    (p + jitter + config.domain_shift).clamp(0.0, 1.0)
                })
                .collect();
            samples.push(Sample {
                image,
                identity,
                camera: k % config.num_cameras,
                index: samples.len(),
            });
        }
    }

    Ok(samples)
}

/// Labelled source domain
pub fn generate_source(config: &SyntheticDomainConfig) -> Result<DomainDataset<SourceItem>> {
    let items = generate(config)?
        .into_iter()
        .map(|s| SourceItem {
            image: s.image,
            identity: s.identity,
            camera: s.camera,
            index: s.index,
        })
        .collect();
    Ok(DomainDataset::new(items))
}

/// Target domain pseudo-labelled at every count in `cluster_counts`
pub fn generate_target(
    config: &SyntheticDomainConfig,
    cluster_counts: &[usize],
) -> Result<DomainDataset<TargetItem>> {
    let samples = generate(config)?;
    let identities: Vec<usize> = samples.iter().map(|s| s.identity).collect();
    let labels = coarsen_labels(&identities, config.num_identities, cluster_counts)?;

    let items = samples
        .into_iter()
        .enumerate()
        .map(|(i, s)| TargetItem {
            image: s.image,
            pseudo_labels: labels.iter().map(|per_k| per_k[i]).collect(),
            index: s.index,
        })
        .collect();
    Ok(DomainDataset::new(items))
}

/// Merge `num_identities` identities into `c` contiguous groups for each `c`
///
/// Returns one label vector per cluster count, aligned with `identities`.
pub fn coarsen_labels(
    identities: &[usize],
    num_identities: usize,
    cluster_counts: &[usize],
) -> Result<Vec<Vec<usize>>> {
    cluster_counts
        .iter()
        .map(|&clusters| {
            if clusters == 0 || clusters > num_identities {
                return Err(UdaError::Config(format!(
                    "cannot form {} clusters from {} identities",
                    clusters, num_identities
                )));
            }
            identities
                .iter()
                .map(|&id| {
                    if id >= num_identities {
                        return Err(UdaError::Dataset(format!(
                            "identity {} outside 0..{}",
                            id, num_identities
                        )));
                    }
                    Ok(id * clusters / num_identities)
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::data::dataset::Dataset;

    fn small() -> SyntheticDomainConfig {
        SyntheticDomainConfig {
            num_identities: 7,
            samples_per_identity: 2,
            image_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_source_is_seeded() {
        let a = generate_source(&small()).unwrap();
        let b = generate_source(&small()).unwrap();
        assert_eq!(a.len(), 14);
        assert_eq!(a.num_identities(), 7);
        assert_eq!(a.items()[5].image, b.items()[5].image);
    }

    #[test]
    fn test_target_carries_one_label_per_granularity() {
        let target = generate_target(&small(), &[5, 7]).unwrap();
        for item in target.items() {
            assert_eq!(item.pseudo_labels.len(), 2);
            assert!(item.pseudo_labels[0] < 5);
            assert!(item.pseudo_labels[1] < 7);
        }
    }

    #[test]
    fn test_coarsen_labels() {
        let labels = coarsen_labels(&[0, 1, 2, 3], 4, &[2, 4]).unwrap();
        assert_eq!(labels[0], vec![0, 0, 1, 1]);
        assert_eq!(labels[1], vec![0, 1, 2, 3]);
        assert!(coarsen_labels(&[0], 4, &[5]).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = small();
        config.image_size = 4;
        assert!(config.validate().is_err());
    }
}
