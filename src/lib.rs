//! # udasbs
//!
//! Unsupervised domain adaptation for re-identification features with a
//! multi-granularity teacher/student scheme, built on the Burn framework.
//!
//! ## Training regimes
//!
//! - **Warm-up** (`PreTrainer`): supervised training on a labelled source
//!   domain with label-smoothed cross-entropy plus a soft triplet term
//! - **Adaptation** (`TeacherStudentTrainer`): the student learns from K
//!   pseudo-label sets of the target domain at once, the teacher follows it
//!   as an exponential moving average
//!
//! ## Modules
//!
//! - `dataset`: batch layouts, Burn datasets and batchers, endless loaders,
//!   synthetic domains
//! - `model`: classifier bank, encoder contract and reference encoder,
//!   experiment configuration
//! - `training`: losses, EMA synchroniser, trainers, checkpoints, pipeline
//! - `utils`: errors, logging, meters and accuracy
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use udasbs::backend::{default_device, TrainingBackend};
//! use udasbs::model::ExperimentConfig;
//! use udasbs::training::{run_adaptation, run_pretraining};
//!
//! let config = ExperimentConfig::quick();
//! let device = default_device();
//! let warm = run_pretraining::<TrainingBackend>(&config, None, &device)?;
//! let adapted = run_adaptation::<TrainingBackend>(&config, Some(warm.model), None, &device)?;
//! ```

pub mod backend;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use dataset::{BatchSource, IterLoader, SourceBatch, TargetBatch};
pub use model::{
    ClassifierBank, EncoderOutput, ExperimentConfig, GranularitySpec, ReidEncoder, ReidNet,
    ReidNetConfig,
};
pub use training::{
    AdaptationStep, CrossEntropyLabelSmooth, LossCombination, MomentumSynchronizer, PreTrainer,
    SoftTripletLoss, TeacherStudentTrainer, TripletCriterion, TripletLoss,
};
pub use utils::error::{Result, UdaError};
pub use utils::meters::{AverageMeter, EpochSummary};

/// Default target decay of the EMA teacher
pub const DEFAULT_EMA_DECAY: f64 = 0.999;

/// Default optimizer steps per epoch
pub const DEFAULT_ITERATIONS: usize = 200;

pub use training::losses::DEFAULT_LABEL_SMOOTHING;
