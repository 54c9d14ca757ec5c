//! Dataset module
//!
//! Batch layouts for both domains, Burn `Dataset`/`Batcher` implementations,
//! an endless shuffling loader and seeded synthetic domains.

pub mod batch;
pub mod burn_dataset;
pub mod iter_loader;
pub mod synthetic;

pub use batch::{shuffle_ids, SourceBatch, TargetBatch, TargetInputs};
pub use burn_dataset::{DomainDataset, SourceBatcher, SourceItem, TargetBatcher, TargetItem};
pub use iter_loader::{BatchSource, IterLoader};
pub use synthetic::{coarsen_labels, generate_source, generate_target, SyntheticDomainConfig};
