//! Experiment Configuration Module
//!
//! Serde structures for the encoder shape, the warm-up phase, the adaptation
//! phase and the synthetic domains, bundled into one JSON-backed
//! [`ExperimentConfig`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::backbone::ReidNetConfig;
use crate::dataset::SyntheticDomainConfig;
use crate::training::losses::TripletCriterion;
use crate::training::mutual::{AdaptationStep, LossCombination};
use crate::utils::error::{Result, UdaError};

/// Encoder hyper-parameters shared by both phases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    pub in_channels: usize,
    pub base_filters: usize,
    pub feature_dim: usize,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            base_filters: 16,
            feature_dim: 128,
        }
    }
}

impl BackboneConfig {
    /// Encoder configuration with one head per entry of `cluster_counts`
    pub fn reid_config(&self, cluster_counts: Vec<usize>) -> ReidNetConfig {
        ReidNetConfig::new(cluster_counts)
            .with_in_channels(self.in_channels)
            .with_base_filters(self.base_filters)
            .with_feature_dim(self.feature_dim)
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 || self.base_filters == 0 || self.feature_dim == 0 {
            return Err(UdaError::Config(
                "backbone dimensions must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Source-only warm-up settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainConfig {
    pub epochs: usize,
    /// Optimizer steps per epoch
    pub iterations: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Emit a progress line every N iterations
    pub log_every: usize,
    pub triplet: TripletCriterion,
    pub seed: u64,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            epochs: 2,
            iterations: 200,
            batch_size: 16,
            learning_rate: 3.5e-4,
            weight_decay: 5e-4,
            log_every: 50,
            triplet: TripletCriterion::default(),
            seed: 42,
        }
    }
}

impl PretrainConfig {
    pub fn validate(&self) -> Result<()> {
        validate_schedule(self.iterations, self.batch_size, self.log_every)?;
        validate_optimizer(self.learning_rate, self.weight_decay)
    }
}

/// Teacher/student adaptation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationConfig {
    pub epochs: usize,
    pub iterations: usize,
    pub batch_size: usize,
    /// Cluster count of each pseudo-label granularity
    pub cluster_counts: Vec<usize>,
    /// Index into `cluster_counts` used by the triplet term and precision
    pub chosen_granularity: usize,
    /// Target EMA decay for the teacher
    pub ema_decay: f64,
    pub ce_soft_weight: f64,
    pub tri_soft_weight: f64,
    pub loss_combination: LossCombination,
    pub triplet: TripletCriterion,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub log_every: usize,
    pub seed: u64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            epochs: 2,
            iterations: 200,
            batch_size: 16,
            cluster_counts: vec![4, 8, 16],
            chosen_granularity: 0,
            ema_decay: 0.999,
            ce_soft_weight: 0.5,
            tri_soft_weight: 0.5,
            loss_combination: LossCombination::Unweighted,
            triplet: TripletCriterion::soft(Some(0.0)),
            learning_rate: 3.5e-4,
            weight_decay: 5e-4,
            log_every: 50,
            seed: 42,
        }
    }
}

impl AdaptationConfig {
    pub fn validate(&self) -> Result<()> {
        validate_schedule(self.iterations, self.batch_size, self.log_every)?;
        validate_optimizer(self.learning_rate, self.weight_decay)?;

        if self.cluster_counts.is_empty() || self.cluster_counts.contains(&0) {
            return Err(UdaError::Config(
                "cluster_counts must be non-empty and positive".to_string(),
            ));
        }
        if self.chosen_granularity >= self.cluster_counts.len() {
            return Err(UdaError::Config(format!(
                "chosen_granularity {} out of range for {} granularities",
                self.chosen_granularity,
                self.cluster_counts.len()
            )));
        }
        if !(0.0..=1.0).contains(&self.ema_decay) {
            return Err(UdaError::Config(format!(
                "ema_decay must be in [0, 1], got {}",
                self.ema_decay
            )));
        }
        if self.ce_soft_weight < 0.0 || self.tri_soft_weight < 0.0 {
            return Err(UdaError::Config("loss weights must be non-negative".to_string()));
        }
        Ok(())
    }

    /// Per-epoch trainer arguments
    pub fn step(&self) -> AdaptationStep {
        AdaptationStep {
            chosen_granularity: self.chosen_granularity,
            ce_soft_weight: self.ce_soft_weight,
            tri_soft_weight: self.tri_soft_weight,
            log_every: self.log_every,
            iterations: self.iterations,
            learning_rate: self.learning_rate,
        }
    }
}

/// Everything one run needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub backbone: BackboneConfig,
    pub source: SyntheticDomainConfig,
    pub target: SyntheticDomainConfig,
    pub pretrain: PretrainConfig,
    pub adaptation: AdaptationConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let source = SyntheticDomainConfig::default();
        let target = SyntheticDomainConfig {
            domain_shift: 0.2,
            seed: 7,
            ..source.clone()
        };
        Self {
            backbone: BackboneConfig::default(),
            source,
            target,
            pretrain: PretrainConfig::default(),
            adaptation: AdaptationConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Small, fast settings for smoke runs
    pub fn quick() -> Self {
        let mut config = Self::default();
        config.backbone.base_filters = 8;
        config.backbone.feature_dim = 32;
        config.pretrain.epochs = 1;
        config.pretrain.iterations = 10;
        config.pretrain.log_every = 5;
        config.adaptation.epochs = 1;
        config.adaptation.iterations = 10;
        config.adaptation.log_every = 5;
        config
    }

    /// Validate every section and their cross-constraints
    pub fn validate(&self) -> Result<()> {
        self.backbone.validate()?;
        self.source.validate()?;
        self.target.validate()?;
        self.pretrain.validate()?;
        self.adaptation.validate()?;

        if self.source.image_size != self.target.image_size {
            return Err(UdaError::Config(format!(
                "source images are {}px, target images {}px",
                self.source.image_size, self.target.image_size
            )));
        }
        if self.pretrain.batch_size > self.source.len()
            || self.pretrain.batch_size > self.target.len()
        {
            return Err(UdaError::Config(
                "warm-up batch_size exceeds a domain size".to_string(),
            ));
        }
        if self.adaptation.batch_size > self.target.len() {
            return Err(UdaError::Config(
                "adaptation batch_size exceeds the target domain size".to_string(),
            ));
        }
        if let Some(&too_many) = self
            .adaptation
            .cluster_counts
            .iter()
            .find(|&&c| c > self.target.num_identities)
        {
            return Err(UdaError::Config(format!(
                "{} clusters requested from {} target identities",
                too_many, self.target.num_identities
            )));
        }
        Ok(())
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

fn validate_schedule(iterations: usize, batch_size: usize, log_every: usize) -> Result<()> {
    if iterations == 0 {
        return Err(UdaError::Config("iterations must be positive".to_string()));
    }
    // Batch-hard mining needs at least one other sample per anchor.
    if batch_size < 2 {
        return Err(UdaError::Config("batch_size must be at least 2".to_string()));
    }
    if log_every == 0 {
        return Err(UdaError::Config("log_every must be positive".to_string()));
    }
    Ok(())
}

fn validate_optimizer(learning_rate: f64, weight_decay: f64) -> Result<()> {
    if learning_rate <= 0.0 {
        return Err(UdaError::Config("learning_rate must be positive".to_string()));
    }
    if weight_decay < 0.0 {
        return Err(UdaError::Config("weight_decay must be non-negative".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ExperimentConfig::default().validate().is_ok());
        assert!(ExperimentConfig::quick().validate().is_ok());
    }

    #[test]
    fn test_adaptation_defaults() {
        let config = AdaptationConfig::default();
        assert_eq!(config.ema_decay, 0.999);
        assert_eq!(config.iterations, 200);
        assert_eq!(config.loss_combination, LossCombination::Unweighted);
        assert_eq!(config.step().ce_soft_weight, 0.5);
    }

    #[test]
    fn test_chosen_granularity_must_exist() {
        let config = AdaptationConfig {
            chosen_granularity: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(UdaError::Config(_))));
    }

    #[test]
    fn test_cluster_counts_bounded_by_target_identities() {
        let mut config = ExperimentConfig::default();
        config.adaptation.cluster_counts = vec![4, 32];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_triplet_choice() {
        let mut config = ExperimentConfig::quick();
        config.adaptation.triplet = TripletCriterion::hard(0.3);
        config.adaptation.loss_combination = LossCombination::Weighted;

        let path = std::env::temp_dir().join(format!("udasbs-config-{}.json", std::process::id()));
        config.save(&path).unwrap();
        let loaded = ExperimentConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded, config);
    }
}
