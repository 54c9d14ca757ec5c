//! Teacher/student mutual learning on the pseudo-labelled target domain.
//!
//! The student is trained against every granularity of pseudo-labels at
//! once; the teacher is never optimised directly and only follows the
//! student through [`MomentumSynchronizer`] after each optimizer step.

use std::time::Instant;

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion, Tensor},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::losses::TripletCriterion;
use super::momentum::MomentumSynchronizer;
use crate::dataset::{BatchSource, TargetBatch};
use crate::model::{GranularitySpec, ReidEncoder};
use crate::utils::error::{Result, UdaError};
use crate::utils::meters::{EpochSummary, TrainMeters};
use crate::utils::metrics::top1_accuracy;

/// How the classification and triplet terms form the optimised loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossCombination {
    /// `ce + tri`
    #[default]
    Unweighted,
    /// `ce_soft_weight * ce + tri_soft_weight * tri`
    Weighted,
}

impl LossCombination {
    pub fn combine<B: Backend>(
        &self,
        ce: Tensor<B, 1>,
        tri: Tensor<B, 1>,
        ce_weight: f64,
        tri_weight: f64,
    ) -> Tensor<B, 1> {
        match self {
            LossCombination::Unweighted => ce + tri,
            LossCombination::Weighted => {
                ce.mul_scalar(ce_weight as f32) + tri.mul_scalar(tri_weight as f32)
            }
        }
    }
}

/// Per-epoch knobs of [`TeacherStudentTrainer::train`]
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationStep {
    /// Granularity whose labels drive the triplet term and the precision
    pub chosen_granularity: usize,
    pub ce_soft_weight: f64,
    pub tri_soft_weight: f64,
    pub log_every: usize,
    pub iterations: usize,
    pub learning_rate: f64,
}

impl Default for AdaptationStep {
    fn default() -> Self {
        Self {
            chosen_granularity: 0,
            ce_soft_weight: 0.5,
            tri_soft_weight: 0.5,
            log_every: 100,
            iterations: 200,
            learning_rate: 3.5e-4,
        }
    }
}

/// Student trained on pseudo-labels, teacher kept as its moving average
pub struct TeacherStudentTrainer<B: AutodiffBackend, M> {
    student: M,
    teacher: M,
    granularity: GranularitySpec,
    synchronizer: MomentumSynchronizer,
    triplet: TripletCriterion,
    combination: LossCombination,
    device: B::Device,
}

impl<B, M> TeacherStudentTrainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ReidEncoder<B>,
{
    pub fn new(
        student: M,
        teacher: M,
        granularity: GranularitySpec,
        ema_decay: f64,
        device: B::Device,
    ) -> Result<Self> {
        for (role, model) in [("student", &student), ("teacher", &teacher)] {
            let bank = model.classifier_bank().granularity();
            if *bank != granularity {
                return Err(UdaError::Config(format!(
                    "{} bank {:?} does not match granularities {:?}",
                    role,
                    bank.as_slice(),
                    granularity.as_slice()
                )));
            }
        }

        debug!(
            granularities = ?granularity.as_slice(),
            ema_decay,
            "teacher/student trainer ready"
        );

        Ok(Self {
            student,
            teacher: teacher.no_grad(),
            granularity,
            synchronizer: MomentumSynchronizer::new(ema_decay)?,
            triplet: TripletCriterion::soft(Some(0.0)),
            combination: LossCombination::default(),
            device,
        })
    }

    pub fn with_triplet(mut self, triplet: TripletCriterion) -> Self {
        self.triplet = triplet;
        self
    }

    pub fn with_loss_combination(mut self, combination: LossCombination) -> Self {
        self.combination = combination;
        self
    }

    pub fn student(&self) -> &M {
        &self.student
    }

    pub fn teacher(&self) -> &M {
        &self.teacher
    }

    pub fn synchronizer(&self) -> &MomentumSynchronizer {
        &self.synchronizer
    }

    /// `(student, teacher)`
    pub fn into_models(self) -> (M, M) {
        (self.student, self.teacher)
    }

    /// Run `step.iterations` student updates, each followed by a teacher sync
    pub fn train<T, O>(
        &mut self,
        epoch: usize,
        target: &mut T,
        optimizer: &mut O,
        step: &AdaptationStep,
    ) -> Result<EpochSummary>
    where
        T: BatchSource<TargetBatch<B>>,
        O: Optimizer<M, B>,
    {
        let num_granularities = self.granularity.len();
        if step.chosen_granularity >= num_granularities {
            return Err(UdaError::Config(format!(
                "chosen granularity {} out of range for {} granularities",
                step.chosen_granularity, num_granularities
            )));
        }
        if step.log_every == 0 {
            return Err(UdaError::Config("log_every must be positive".to_string()));
        }

        let mut meters = TrainMeters::new();
        let mut end = Instant::now();

        for i in 0..step.iterations {
            let batch = target.next_batch()?;
            meters.data_time.update(end.elapsed().as_secs_f64(), 1);

            let inputs = batch.into_inputs(num_granularities)?;
            if inputs.view_1.device() != self.device {
                return Err(UdaError::Device(format!(
                    "batch on {:?}, model on {:?}",
                    inputs.view_1.device(),
                    self.device
                )));
            }
            let chosen = inputs.labels[step.chosen_granularity].clone();

            let out = self.student.forward(inputs.view_1.clone(), true);
            // Teacher output is computed but not consumed by the loss.
            let _teacher_out = self.teacher.forward(inputs.view_1, true).detach();

            let loss_ce = self
                .student
                .classifier_bank()
                .classification_loss(&out.logits, &inputs.labels)?;
            let loss_tri = self.triplet.forward(out.features, chosen.clone())?;
            let loss = self.combination.combine(
                loss_ce.clone(),
                loss_tri.clone(),
                step.ce_soft_weight,
                step.tri_soft_weight,
            );

            let ce_value: f64 = loss_ce.into_scalar().elem();
            let tri_value: f64 = loss_tri.into_scalar().elem();
            let head_logits = out
                .logits
                .first()
                .map(|logits| logits.clone().detach())
                .ok_or_else(|| UdaError::Config("model returned no logits".to_string()))?;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.student);
            self.student = optimizer.step(step.learning_rate, self.student.clone(), grads);

            let global_step = epoch * step.iterations + i;
            self.teacher = self
                .synchronizer
                .sync(&self.student, self.teacher.clone(), global_step)?;

            let precision = top1_accuracy(head_logits, chosen);

            meters.loss_ce.update(ce_value, 1);
            meters.loss_tri.update(tri_value, 1);
            meters.precision.update(precision, 1);

            meters.batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();

            if (i + 1) % step.log_every == 0 {
                info!("{}", meters.progress_line(epoch, i + 1, step.iterations));
            }
        }

        Ok(meters.summary(epoch, step.iterations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::module::Module;
    use burn::optim::AdamConfig;
    use burn_ndarray::NdArray;

    use crate::dataset::{
        generate_target, IterLoader, SyntheticDomainConfig, TargetBatcher, TargetItem,
    };
    use crate::model::{ReidNet, ReidNetConfig};
    use crate::training::momentum::parameter_snapshot;

    type TestBackend = Autodiff<NdArray<f32>>;
    type Device = <TestBackend as Backend>::Device;

    const COUNTS: [usize; 2] = [5, 7];

    fn config() -> ReidNetConfig {
        ReidNetConfig::new(COUNTS.to_vec())
            .with_base_filters(4)
            .with_feature_dim(16)
    }

    fn loader(device: &Device) -> IterLoader<TestBackend, TargetItem, TargetBatch<TestBackend>> {
        let domain = SyntheticDomainConfig {
            num_identities: 7,
            samples_per_identity: 2,
            image_size: 8,
            ..Default::default()
        };
        IterLoader::new(
            generate_target(&domain, &COUNTS).unwrap(),
            TargetBatcher::new(8, COUNTS.len()),
            4,
            11,
            device.clone(),
        )
        .unwrap()
    }

    fn trainer_from(
        student: ReidNet<TestBackend>,
        device: &Device,
    ) -> TeacherStudentTrainer<TestBackend, ReidNet<TestBackend>> {
        let teacher = config().init_teacher(&student, device).unwrap();
        TeacherStudentTrainer::new(
            student,
            teacher,
            GranularitySpec::new(COUNTS.to_vec()).unwrap(),
            0.999,
            device.clone(),
        )
        .unwrap()
    }

    fn snapshot(model: &ReidNet<TestBackend>) -> Vec<Vec<f32>> {
        parameter_snapshot::<TestBackend, _>(model)
            .into_iter()
            .map(|d| d.to_vec().unwrap())
            .collect()
    }

    fn one_iteration() -> AdaptationStep {
        AdaptationStep {
            iterations: 1,
            log_every: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_teacher_synced_after_student_step() {
        let device = Device::default();
        let student = config().init(&device).unwrap();
        let mut trainer = trainer_from(student, &device);
        let before = snapshot(trainer.student());

        let mut optimizer = AdamConfig::new().init::<TestBackend, ReidNet<TestBackend>>();
        trainer
            .train(0, &mut loader(&device), &mut optimizer, &one_iteration())
            .unwrap();

        let student = snapshot(trainer.student());
        let teacher = snapshot(trainer.teacher());
        assert_ne!(student, before);
        assert_eq!(teacher, student);
        assert_eq!(trainer.synchronizer().updates(), 1);
    }

    #[test]
    fn test_single_iteration_is_deterministic() {
        let device = Device::default();
        let first = config().init(&device).unwrap();
        let second = config()
            .init(&device)
            .unwrap()
            .load_record(first.clone().into_record());

        let mut a = trainer_from(first, &device);
        let mut b = trainer_from(second, &device);
        let mut opt_a = AdamConfig::new().init::<TestBackend, ReidNet<TestBackend>>();
        let mut opt_b = AdamConfig::new().init::<TestBackend, ReidNet<TestBackend>>();

        let sa = a
            .train(0, &mut loader(&device), &mut opt_a, &one_iteration())
            .unwrap();
        let sb = b
            .train(0, &mut loader(&device), &mut opt_b, &one_iteration())
            .unwrap();

        assert_eq!(sa.loss_ce, sb.loss_ce);
        assert_eq!(sa.loss_tri, sb.loss_tri);
        assert_eq!(sa.precision, sb.precision);
        assert_eq!(snapshot(a.student()), snapshot(b.student()));
    }

    #[test]
    fn test_chosen_granularity_out_of_range() {
        let device = Device::default();
        let mut trainer = trainer_from(config().init(&device).unwrap(), &device);
        let mut optimizer = AdamConfig::new().init::<TestBackend, ReidNet<TestBackend>>();

        let step = AdaptationStep {
            chosen_granularity: 2,
            ..one_iteration()
        };
        let err = trainer
            .train(0, &mut loader(&device), &mut optimizer, &step)
            .unwrap_err();
        assert!(matches!(err, UdaError::Config(_)));
        assert_eq!(trainer.synchronizer().updates(), 0);
    }

    #[test]
    fn test_bank_must_match_granularity() {
        let device = Device::default();
        let student: ReidNet<TestBackend> = config().init(&device).unwrap();
        let teacher = config().init_teacher(&student, &device).unwrap();
        let result = TeacherStudentTrainer::new(
            student,
            teacher,
            GranularitySpec::new(vec![5, 9]).unwrap(),
            0.999,
            device,
        );
        assert!(matches!(result, Err(UdaError::Config(_))));
    }

    #[test]
    fn test_weighted_combination() {
        let device = Device::default();
        let ce = Tensor::<TestBackend, 1>::from_floats([2.0], &device);
        let tri = Tensor::<TestBackend, 1>::from_floats([4.0], &device);

        let unweighted: f32 = LossCombination::Unweighted
            .combine(ce.clone(), tri.clone(), 0.5, 0.5)
            .into_scalar()
            .elem();
        let weighted: f32 = LossCombination::Weighted
            .combine(ce, tri, 0.5, 0.25)
            .into_scalar()
            .elem();
        assert_eq!(unweighted, 6.0);
        assert_eq!(weighted, 2.0);
    }
}
