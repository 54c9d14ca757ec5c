//! Exponential moving average of student weights into the teacher.
//!
//! The ramp `min(1 - 1/(step+1), target)` starts at zero, so the first sync
//! copies the student outright and later syncs converge to the target decay.

use burn::{
    module::{Module, ModuleMapper, ModuleVisitor, ParamId},
    tensor::{backend::Backend, Tensor, TensorData},
};

use crate::utils::error::{Result, UdaError};

/// Blends teacher parameters towards the student after each optimizer step
#[derive(Debug, Clone)]
pub struct MomentumSynchronizer {
    target_decay: f64,
    updates: usize,
}

impl MomentumSynchronizer {
    pub fn new(target_decay: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&target_decay) {
            return Err(UdaError::Config(format!(
                "EMA decay must lie in [0, 1], got {}",
                target_decay
            )));
        }
        Ok(Self {
            target_decay,
            updates: 0,
        })
    }

    pub fn target_decay(&self) -> f64 {
        self.target_decay
    }

    /// Number of completed syncs
    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn effective_decay(&self, step: usize) -> f64 {
        (1.0 - 1.0 / (step as f64 + 1.0)).min(self.target_decay)
    }

    /// `teacher ← teacher·d + student·(1 - d)` over every float tensor
    ///
    /// Both modules are walked in the same fixed order and must match tensor
    /// for tensor. On a mismatch nothing is mapped and the teacher is dropped.
    pub fn sync<B: Backend, M: Module<B>>(
        &mut self,
        student: &M,
        teacher: M,
        step: usize,
    ) -> Result<M> {
        let mut collector = Collector::<B>::default();
        student.visit(&mut collector);

        let mut shapes = ShapeCollector::default();
        teacher.visit(&mut shapes);

        if shapes.shapes.len() != collector.tensors.len() {
            return Err(UdaError::Config(format!(
                "teacher has {} tensors, student has {}",
                shapes.shapes.len(),
                collector.tensors.len()
            )));
        }
        for (index, (teacher_shape, (student_shape, _))) in
            shapes.shapes.iter().zip(&collector.tensors).enumerate()
        {
            if teacher_shape != student_shape {
                return Err(UdaError::Config(format!(
                    "tensor {} differs: teacher {:?}, student {:?}",
                    index, teacher_shape, student_shape
                )));
            }
        }

        let decay = self.effective_decay(step);
        let mut blender = Blender {
            student: collector.tensors.into_iter(),
            decay,
        };
        let teacher = teacher.map(&mut blender).no_grad();

        self.updates += 1;
        tracing::trace!(step, decay, updates = self.updates, "teacher synced");

        Ok(teacher)
    }
}

/// Host copy of every float tensor of `module`, in visit order
pub fn parameter_snapshot<B: Backend, M: Module<B>>(module: &M) -> Vec<TensorData> {
    let mut snapshot = Snapshot::default();
    module.visit(&mut snapshot);
    snapshot.data
}

struct Collector<B: Backend> {
    tensors: Vec<(Vec<usize>, Tensor<B, 1>)>,
}

impl<B: Backend> Default for Collector<B> {
    fn default() -> Self {
        Self {
            tensors: Vec::new(),
        }
    }
}

impl<B: Backend> ModuleVisitor<B> for Collector<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let dims = tensor.dims().to_vec();
        let numel = dims.iter().product::<usize>();
        self.tensors
            .push((dims, tensor.clone().detach().reshape([numel])));
    }
}

#[derive(Default)]
struct ShapeCollector {
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.shapes.push(tensor.dims().to_vec());
    }
}

struct Blender<B: Backend> {
    student: std::vec::IntoIter<(Vec<usize>, Tensor<B, 1>)>,
    decay: f64,
}

impl<B: Backend> ModuleMapper<B> for Blender<B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        // Shapes were checked before mapping, so the iterator cannot run dry.
        let Some((_, flat)) = self.student.next() else {
            return tensor;
        };
        let student = flat.reshape(tensor.dims());

        if self.decay == 0.0 {
            return student;
        }
        (tensor.detach().mul_scalar(self.decay as f32)
            + student.mul_scalar((1.0 - self.decay) as f32))
        .detach()
    }
}

#[derive(Default)]
struct Snapshot {
    data: Vec<TensorData>,
}

impl<B: Backend> ModuleVisitor<B> for Snapshot {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.data.push(tensor.to_data());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::nn::{Linear, LinearConfig};
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn values(module: &Linear<TestBackend>) -> Vec<Vec<f32>> {
        parameter_snapshot::<TestBackend, _>(module)
            .into_iter()
            .map(|d| d.to_vec::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_effective_decay_ramp() {
        let sync = MomentumSynchronizer::new(0.999).unwrap();

        assert_eq!(sync.effective_decay(0), 0.0);
        assert!((sync.effective_decay(1) - 0.5).abs() < 1e-12);
        assert!((sync.effective_decay(9) - 0.9).abs() < 1e-12);
        assert_eq!(sync.effective_decay(10_000), 0.999);

        let mut previous = -1.0;
        for step in 0..5_000 {
            let d = sync.effective_decay(step);
            assert!(d >= previous);
            assert!(d <= 0.999);
            previous = d;
        }
    }

    #[test]
    fn test_decay_out_of_range_rejected() {
        assert!(MomentumSynchronizer::new(1.5).is_err());
        assert!(MomentumSynchronizer::new(-0.1).is_err());
    }

    #[test]
    fn test_step_zero_copies_student_exactly() {
        let device = Default::default();
        let student: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);
        let teacher: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);
        assert_ne!(values(&student), values(&teacher));

        let mut sync = MomentumSynchronizer::new(0.999).unwrap();
        let teacher = sync.sync(&student, teacher, 0).unwrap();

        assert_eq!(values(&student), values(&teacher));
        assert_eq!(sync.updates(), 1);
    }

    #[test]
    fn test_late_step_moves_teacher_slightly() {
        let device = Default::default();
        let student: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);
        let teacher: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);
        let before = values(&teacher);
        let target = values(&student);

        let mut sync = MomentumSynchronizer::new(0.999).unwrap();
        let teacher = sync.sync(&student, teacher, 10_000).unwrap();
        let after = values(&teacher);

        for ((t0, s), t1) in before.iter().zip(&target).zip(&after) {
            for ((t0, s), t1) in t0.iter().zip(s).zip(t1) {
                let expected = t0 * 0.999 + s * 0.001;
                assert!((t1 - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_teacher_is_no_grad_after_sync() {
        let device = Default::default();
        let student: Linear<TestBackend> = LinearConfig::new(2, 2).init(&device);
        let teacher: Linear<TestBackend> = LinearConfig::new(2, 2).init(&device);

        let mut sync = MomentumSynchronizer::new(0.9).unwrap();
        let teacher = sync.sync(&student, teacher, 3).unwrap();
        assert!(!teacher.weight.val().is_require_grad());
    }

    #[test]
    fn test_structure_mismatch_is_config_error() {
        let device = Default::default();
        let student: Linear<TestBackend> = LinearConfig::new(5, 2).init(&device);
        let teacher: Linear<TestBackend> = LinearConfig::new(7, 2).init(&device);

        let mut sync = MomentumSynchronizer::new(0.999).unwrap();
        let err = sync.sync(&student, teacher, 4).unwrap_err();
        assert!(matches!(err, UdaError::Config(_)));
        assert_eq!(sync.updates(), 0);
    }
}
