//! Model checkpoints with a JSON sidecar describing them.
//!
//! Weights go through Burn's `CompactRecorder`, which appends `.mpk` to the
//! given path. The sidecar sits next to it with a `.json` extension.

use std::path::{Path, PathBuf};

use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::error::{Result, UdaError};

/// Which training phase produced a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pretrain,
    Adaptation,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pretrain => write!(f, "pretrain"),
            Phase::Adaptation => write!(f, "adaptation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub phase: Phase,
    /// Last completed epoch (0-indexed)
    pub epoch: usize,
    /// Mean precision of that epoch
    pub precision: f64,
    /// Head sizes of the saved classifier bank
    pub cluster_counts: Vec<usize>,
    pub created_at: DateTime<Local>,
}

impl CheckpointMetadata {
    pub fn new(phase: Phase, epoch: usize, precision: f64, cluster_counts: Vec<usize>) -> Self {
        Self {
            phase,
            epoch,
            precision,
            cluster_counts,
            created_at: Local::now(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Sidecar path for the weights stored at `model_path`
pub fn metadata_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("json")
}

/// Save `model` and its sidecar, creating parent directories as needed
pub fn save_model<B: Backend, M: Module<B>>(
    model: &M,
    path: &Path,
    metadata: &CheckpointMetadata,
) -> Result<()> {
    info!("Saving checkpoint to {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let recorder = CompactRecorder::new();
    model
        .clone()
        .save_file(path, &recorder)
        .map_err(|e| UdaError::Checkpoint(path.to_path_buf(), format!("{:?}", e)))?;
    metadata.save(&metadata_path(path))?;

    info!(
        "Checkpoint saved ({} epoch {}, precision {:.2}%)",
        metadata.phase,
        metadata.epoch + 1,
        metadata.precision * 100.0
    );
    Ok(())
}

/// Load weights from `path` into `model`, which fixes the expected structure
pub fn load_model<B: Backend, M: Module<B>>(model: M, path: &Path, device: &B::Device) -> Result<M> {
    info!("Loading checkpoint from {:?}", path);

    let recorder = CompactRecorder::new();
    model
        .load_file(path, &recorder, device)
        .map_err(|e| UdaError::Checkpoint(path.to_path_buf(), format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    use crate::model::{ReidNet, ReidNetConfig};
    use crate::training::momentum::parameter_snapshot;

    type TestBackend = NdArray<f32>;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("udasbs-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn values(model: &ReidNet<TestBackend>) -> Vec<Vec<f32>> {
        parameter_snapshot::<TestBackend, _>(model)
            .into_iter()
            .map(|d| d.to_vec().unwrap())
            .collect()
    }

    #[test]
    fn test_weights_and_metadata_survive_a_save() {
        let device = Default::default();
        let config = ReidNetConfig::new(vec![3, 5])
            .with_base_filters(4)
            .with_feature_dim(8);
        let model: ReidNet<TestBackend> = config.init(&device).unwrap();

        let dir = scratch_dir("ckpt");
        let path = dir.join("nested").join("model");
        let metadata = CheckpointMetadata::new(Phase::Adaptation, 4, 0.5, vec![3, 5]);
        save_model(&model, &path, &metadata).unwrap();

        let fresh: ReidNet<TestBackend> = config.init(&device).unwrap();
        let restored = load_model(fresh, &path, &device).unwrap();
        // Weights are stored at half precision
        let (saved, restored) = (values(&model), values(&restored));
        assert_eq!(saved.len(), restored.len());
        for (a, b) in saved.iter().zip(&restored) {
            assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(b) {
                assert!((x - y).abs() <= 1e-3 * x.abs().max(1e-2), "{} vs {}", x, y);
            }
        }

        let loaded = CheckpointMetadata::load(&metadata_path(&path)).unwrap();
        assert_eq!(loaded, metadata);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_checkpoint_is_reported_with_path() {
        let device = Default::default();
        let model: ReidNet<TestBackend> = ReidNetConfig::new(vec![3])
            .with_base_filters(4)
            .with_feature_dim(8)
            .init(&device)
            .unwrap();

        let path = scratch_dir("missing").join("model");
        match load_model(model, &path, &device) {
            Err(UdaError::Checkpoint(p, _)) => assert_eq!(p, path),
            other => panic!("expected checkpoint error, got {:?}", other.map(|_| ())),
        }
    }
}
