//! Supervised warm-up on the labelled source domain.
//!
//! Each iteration pulls one source and one target batch. Only the source
//! batch feeds the loss; the target forward pass exists so batch-norm
//! statistics also see the target distribution.

use std::time::Instant;

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion, Int, Tensor},
};
use tracing::{debug, info};

use super::losses::{CrossEntropyLabelSmooth, TripletCriterion};
use crate::dataset::{BatchSource, SourceBatch};
use crate::model::ReidEncoder;
use crate::utils::error::{Result, UdaError};
use crate::utils::meters::{EpochSummary, TrainMeters};
use crate::utils::metrics::top1_accuracy;

/// Loss terms of one warm-up step
#[derive(Debug, Clone)]
pub struct StepLosses<B: Backend> {
    pub ce: Tensor<B, 1>,
    pub triplet: Tensor<B, 1>,
    /// `ce + triplet`, unweighted
    pub total: Tensor<B, 1>,
    /// Top-1 accuracy of the first head
    pub precision: f64,
}

/// Source-only warm-up trainer
pub struct PreTrainer<B: AutodiffBackend, M> {
    model: M,
    criterion_ce: CrossEntropyLabelSmooth,
    criterion_triplet: TripletCriterion,
    device: B::Device,
}

impl<B, M> PreTrainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ReidEncoder<B>,
{
    pub fn new(
        model: M,
        num_classes: usize,
        triplet: TripletCriterion,
        device: B::Device,
    ) -> Result<Self> {
        let head_classes = model
            .classifier_bank()
            .criterion(0)
            .map(|c| c.num_classes());
        if num_classes == 0 || head_classes != Some(num_classes) {
            return Err(UdaError::Config(format!(
                "first head has {:?} classes, warm-up needs {}",
                head_classes, num_classes
            )));
        }

        debug!(num_classes, ?triplet, "pre-trainer ready");

        Ok(Self {
            model,
            criterion_ce: CrossEntropyLabelSmooth::new(num_classes),
            criterion_triplet: triplet,
            device,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Run `iterations` optimizer steps and return the epoch averages
    #[allow(clippy::too_many_arguments)]
    pub fn train<S, T, O>(
        &mut self,
        epoch: usize,
        source: &mut S,
        target: &mut T,
        optimizer: &mut O,
        learning_rate: f64,
        iterations: usize,
        log_every: usize,
    ) -> Result<EpochSummary>
    where
        S: BatchSource<SourceBatch<B>>,
        T: BatchSource<SourceBatch<B>>,
        O: Optimizer<M, B>,
    {
        if log_every == 0 {
            return Err(UdaError::Config("log_every must be positive".to_string()));
        }

        let mut meters = TrainMeters::new();
        let mut end = Instant::now();

        for i in 0..iterations {
            let source_batch = source.next_batch()?;
            let target_batch = target.next_batch()?;
            meters.data_time.update(end.elapsed().as_secs_f64(), 1);

            let (s_inputs, targets) = source_batch.into_inputs()?;
            let (t_inputs, _) = target_batch.into_inputs()?;
            self.check_device(&s_inputs.device())?;
            self.check_device(&t_inputs.device())?;

            let s_out = self.model.forward(s_inputs, true);
            // Target pass only refreshes normalisation statistics.
            let _ = self.model.forward(t_inputs, true);

            let logits = s_out
                .logits
                .into_iter()
                .next()
                .ok_or_else(|| UdaError::Config("model returned no logits".to_string()))?;
            let losses = self.step_losses(s_out.features, logits, targets)?;

            let loss_ce: f64 = losses.ce.clone().into_scalar().elem();
            let loss_tri: f64 = losses.triplet.clone().into_scalar().elem();

            let grads = losses.total.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = optimizer.step(learning_rate, self.model.clone(), grads);

            meters.loss_ce.update(loss_ce, 1);
            meters.loss_tri.update(loss_tri, 1);
            meters.precision.update(losses.precision, 1);

            meters.batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();

            if (i + 1) % log_every == 0 {
                info!("{}", meters.progress_line(epoch, i + 1, iterations));
            }
        }

        Ok(meters.summary(epoch, iterations))
    }

    /// Classification and triplet terms for one source batch
    pub fn step_losses(
        &self,
        features: Tensor<B, 2>,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> Result<StepLosses<B>> {
        let ce = self.criterion_ce.forward(logits.clone(), targets.clone())?;
        let triplet = self.criterion_triplet.forward(features, targets.clone())?;
        let precision = top1_accuracy(logits.detach(), targets);

        Ok(StepLosses {
            total: ce.clone() + triplet.clone(),
            ce,
            triplet,
            precision,
        })
    }

    fn check_device(&self, device: &B::Device) -> Result<()> {
        if *device != self.device {
            return Err(UdaError::Device(format!(
                "batch on {:?}, model on {:?}",
                device, self.device
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::optim::AdamConfig;
    use burn::tensor::{Distribution, TensorData};
    use burn_ndarray::NdArray;

    use crate::dataset::{generate_source, IterLoader, SourceBatcher, SyntheticDomainConfig};
    use crate::model::{ReidNet, ReidNetConfig};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn trainer(num_classes: usize) -> PreTrainer<TestBackend, ReidNet<TestBackend>> {
        let device = Default::default();
        let model = ReidNetConfig::new(vec![num_classes])
            .with_base_filters(4)
            .with_feature_dim(16)
            .init(&device)
            .unwrap();
        PreTrainer::new(model, num_classes, TripletCriterion::default(), device).unwrap()
    }

    #[test]
    fn test_total_is_unweighted_sum() {
        let device = Default::default();
        let trainer = trainer(4);
        let features = Tensor::<TestBackend, 2>::random([4, 16], Distribution::Default, &device);
        let logits = Tensor::<TestBackend, 2>::random([4, 4], Distribution::Default, &device);
        let targets = Tensor::from_data(TensorData::new(vec![0i64, 0, 1, 1], [4]), &device);

        let losses = trainer.step_losses(features, logits, targets).unwrap();
        let ce: f32 = losses.ce.into_scalar().elem();
        let tri: f32 = losses.triplet.into_scalar().elem();
        let total: f32 = losses.total.into_scalar().elem();
        assert_eq!(total, ce + tri);
    }

    #[test]
    fn test_head_class_mismatch() {
        let device = Default::default();
        let trainer = trainer(4);
        let features = Tensor::<TestBackend, 2>::zeros([2, 16], &device);
        let logits = Tensor::<TestBackend, 2>::zeros([2, 6], &device);
        let targets = Tensor::from_data(TensorData::new(vec![0i64, 1], [2]), &device);

        assert!(matches!(
            trainer.step_losses(features, logits, targets),
            Err(UdaError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_rejects_model_with_other_class_count() {
        let device = Default::default();
        let model: ReidNet<TestBackend> = ReidNetConfig::new(vec![5])
            .with_base_filters(4)
            .with_feature_dim(16)
            .init(&device)
            .unwrap();
        assert!(PreTrainer::new(model, 6, TripletCriterion::default(), device).is_err());
    }

    #[test]
    fn test_one_epoch_on_synthetic_source() {
        let device: <TestBackend as Backend>::Device = Default::default();
        let config = SyntheticDomainConfig {
            num_identities: 4,
            samples_per_identity: 2,
            image_size: 8,
            ..Default::default()
        };
        let shifted = SyntheticDomainConfig {
            domain_shift: 0.2,
            seed: 3,
            ..config.clone()
        };

        let mut source = IterLoader::new(
            generate_source(&config).unwrap(),
            SourceBatcher::new(8),
            4,
            1,
            device.clone(),
        )
        .unwrap();
        let mut target = IterLoader::new(
            generate_source(&shifted).unwrap(),
            SourceBatcher::new(8),
            4,
            2,
            device.clone(),
        )
        .unwrap();

        let mut trainer = trainer(4);
        let mut optimizer = AdamConfig::new().init::<TestBackend, ReidNet<TestBackend>>();
        let summary = trainer
            .train(0, &mut source, &mut target, &mut optimizer, 3.5e-4, 3, 1)
            .unwrap();

        assert_eq!(summary.iterations, 3);
        assert!(summary.loss_ce.is_finite() && summary.loss_ce > 0.0);
        assert!(summary.loss_tri.is_finite());
        assert!((0.0..=1.0).contains(&summary.precision));
    }
}
