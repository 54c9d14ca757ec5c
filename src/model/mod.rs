//! Model module
//!
//! The classifier bank, the encoder contract with its reference
//! implementation, and the experiment configuration.

pub mod backbone;
pub mod classifier_bank;
pub mod config;

pub use backbone::{ConvBlock, EncoderOutput, ReidEncoder, ReidNet, ReidNetConfig};
pub use classifier_bank::{ClassifierBank, GranularitySpec};
pub use config::{AdaptationConfig, BackboneConfig, ExperimentConfig, PretrainConfig};
