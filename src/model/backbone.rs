//! Reference re-identification encoder.
//!
//! A small CNN producing an embedding per image plus the classifier bank on
//! top. The trainers only see it through [`ReidEncoder`], so any other
//! encoder with the same output contract can be dropped in.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use super::classifier_bank::{ClassifierBank, GranularitySpec};
use crate::training::losses::l2_normalize;
use crate::utils::error::{self, UdaError};

/// What an encoder returns for one image batch
///
/// The `training` flag passed to the encoder only selects which outputs are
/// produced. Batch-norm mode follows the backend: on an autodiff backend the
/// running statistics are updated either way, so evaluation goes through
/// `model.valid()`.
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend> {
    /// Embeddings, raw when `training` is set and L2-normalised otherwise
    pub features: Tensor<B, 2>,
    /// One logits tensor per granularity; empty when `training` is unset
    pub logits: Vec<Tensor<B, 2>>,
    /// Auxiliary normalised embedding; unused by the losses
    pub memory: Option<Tensor<B, 2>>,
}

impl<B: Backend> EncoderOutput<B> {
    pub fn detach(self) -> Self {
        Self {
            features: self.features.detach(),
            logits: self.logits.into_iter().map(|l| l.detach()).collect(),
            memory: self.memory.map(|m| m.detach()),
        }
    }
}

/// Encoder contract used by both trainers
pub trait ReidEncoder<B: Backend> {
    /// `training` selects the output set, not the batch-norm mode
    fn forward(&self, images: Tensor<B, 4>, training: bool) -> EncoderOutput<B>;

    fn classifier_bank(&self) -> &ClassifierBank<B>;
}

/// Configuration for the reference encoder
#[derive(Config, Debug)]
pub struct ReidNetConfig {
    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Filters of the first block; doubled per block
    #[config(default = "16")]
    pub base_filters: usize,

    /// Embedding width fed to the classifier bank
    #[config(default = "128")]
    pub feature_dim: usize,

    /// Cluster count of every classifier head
    pub cluster_counts: Vec<usize>,
}

impl ReidNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<ReidNet<B>> {
        if self.in_channels == 0 || self.base_filters == 0 {
            return Err(UdaError::Config(
                "in_channels and base_filters must be positive".to_string(),
            ));
        }
        let spec = GranularitySpec::new(self.cluster_counts.clone())?;
        let base = self.base_filters;

        Ok(ReidNet {
            block1: ConvBlock::new(self.in_channels, base, 3, device),
            block2: ConvBlock::new(base, base * 2, 3, device),
            block3: ConvBlock::new(base * 2, base * 4, 3, device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            embedding: LinearConfig::new(base * 4, self.feature_dim).init(device),
            bank: ClassifierBank::new(&spec, self.feature_dim, device)?,
        })
    }

    /// Independent copy of `student` to serve as its EMA teacher
    ///
    /// The copy is rebuilt from the student's record rather than cloned, so
    /// no batch-norm running state is shared between the two.
    pub fn init_teacher<B: Backend>(
        &self,
        student: &ReidNet<B>,
        device: &B::Device,
    ) -> error::Result<ReidNet<B>> {
        if student.bank.granularity().as_slice() != self.cluster_counts.as_slice() {
            return Err(UdaError::Config(format!(
                "student bank {:?} does not match config {:?}",
                student.bank.granularity().as_slice(),
                self.cluster_counts
            )));
        }
        Ok(self.init(device)?.load_record(student.clone().into_record()))
    }
}

/// Conv2d, BatchNorm, ReLU and a 2x2 max-pool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Three conv blocks, global pooling, a linear embedding and the bank
#[derive(Module, Debug)]
pub struct ReidNet<B: Backend> {
    pub block1: ConvBlock<B>,
    pub block2: ConvBlock<B>,
    pub block3: ConvBlock<B>,
    pub global_pool: AdaptiveAvgPool2d,
    pub embedding: Linear<B>,
    pub bank: ClassifierBank<B>,
}

impl<B: Backend> ReidNet<B> {
    /// Swap the classifier heads, keeping the backbone
    ///
    /// Used between warm-up (identity heads) and adaptation (cluster heads).
    pub fn with_bank(self, bank: ClassifierBank<B>) -> error::Result<Self> {
        let feature_dim = self.feature_dim();
        let bank_dim = bank
            .heads
            .first()
            .map(|head| head.weight.val().dims()[0])
            .ok_or_else(|| UdaError::Config("replacement bank is empty".to_string()))?;
        if bank_dim != feature_dim {
            return Err(UdaError::ShapeMismatch(format!(
                "bank expects {} features, embedding produces {}",
                bank_dim, feature_dim
            )));
        }
        Ok(Self { bank, ..self })
    }

    /// Embedding width
    pub fn feature_dim(&self) -> usize {
        self.embedding.weight.val().dims()[1]
    }

    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.block1.forward(images);
        let x = self.block2.forward(x);
        let x = self.block3.forward(x);

        // [B, C, H, W] -> [B, C, 1, 1] -> [B, C]
        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        self.embedding.forward(x)
    }
}

impl<B: Backend> ReidEncoder<B> for ReidNet<B> {
    fn forward(&self, images: Tensor<B, 4>, training: bool) -> EncoderOutput<B> {
        let features = self.embed(images);

        if !training {
            return EncoderOutput {
                features: l2_normalize(features),
                logits: Vec::new(),
                memory: None,
            };
        }

        let logits = self.bank.forward(features.clone());
        let memory = l2_normalize(features.clone());
        EncoderOutput {
            features,
            logits,
            memory: Some(memory),
        }
    }

    fn classifier_bank(&self) -> &ClassifierBank<B> {
        &self.bank
    }
}
