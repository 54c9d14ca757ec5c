//! Training module
//!
//! Loss terms, the EMA synchroniser, both trainers, checkpoints and the
//! pipeline that drives them epoch by epoch.

pub mod checkpoint;
pub mod losses;
pub mod momentum;
pub mod mutual;
pub mod pipeline;
pub mod pretrainer;

pub use checkpoint::{load_model, save_model, CheckpointMetadata, Phase};
pub use losses::{CrossEntropyLabelSmooth, SoftTripletLoss, TripletCriterion, TripletLoss};
pub use momentum::{parameter_snapshot, MomentumSynchronizer};
pub use mutual::{AdaptationStep, LossCombination, TeacherStudentTrainer};
pub use pipeline::{load_pretrained, run_adaptation, run_pretraining};
pub use pretrainer::{PreTrainer, StepLosses};
