//! Per-granularity classification heads.
//!
//! One clustering of the target domain yields K label sets at different
//! cluster counts. The bank holds exactly one bias-free linear head and one
//! label-smoothed criterion per entry, in the order the counts were given.

use burn::{
    module::{Ignored, Module},
    nn::{Initializer, Linear, LinearConfig},
    tensor::{backend::Backend, Int, Tensor},
};

use crate::training::losses::CrossEntropyLabelSmooth;
use crate::utils::error::{Result, UdaError};

/// Ordered, non-empty list of positive cluster counts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranularitySpec(Vec<usize>);

impl GranularitySpec {
    pub fn new(cluster_counts: Vec<usize>) -> Result<Self> {
        if cluster_counts.is_empty() {
            return Err(UdaError::Config(
                "at least one granularity is required".to_string(),
            ));
        }
        if let Some(pos) = cluster_counts.iter().position(|&c| c == 0) {
            return Err(UdaError::Config(format!(
                "granularity {} has zero clusters",
                pos
            )));
        }
        Ok(Self(cluster_counts))
    }

    /// Number of granularities (K)
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn cluster_count(&self, index: usize) -> Option<usize> {
        self.0.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &usize> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

/// K classification heads sharing one feature input
#[derive(Module, Debug)]
pub struct ClassifierBank<B: Backend> {
    pub heads: Vec<Linear<B>>,
    criteria: Ignored<Vec<CrossEntropyLabelSmooth>>,
    spec: Ignored<GranularitySpec>,
}

impl<B: Backend> ClassifierBank<B> {
    pub fn new(spec: &GranularitySpec, feature_dim: usize, device: &B::Device) -> Result<Self> {
        if feature_dim == 0 {
            return Err(UdaError::Config("feature_dim must be positive".to_string()));
        }

        let heads = spec
            .iter()
            .map(|&count| {
                LinearConfig::new(feature_dim, count)
                    .with_bias(false)
                    .with_initializer(Initializer::Normal {
                        mean: 0.0,
                        std: 0.001,
                    })
                    .init(device)
            })
            .collect();
        let criteria = spec
            .iter()
            .map(|&count| CrossEntropyLabelSmooth::new(count))
            .collect();

        Ok(Self {
            heads,
            criteria: Ignored(criteria),
            spec: Ignored(spec.clone()),
        })
    }

    /// Logits of every head, in granularity order
    pub fn forward(&self, features: Tensor<B, 2>) -> Vec<Tensor<B, 2>> {
        self.heads
            .iter()
            .map(|head| head.forward(features.clone()))
            .collect()
    }

    pub fn forward_head(&self, index: usize, features: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        self.heads
            .get(index)
            .map(|head| head.forward(features))
            .ok_or_else(|| {
                UdaError::Config(format!(
                    "head {} requested from a bank of {}",
                    index,
                    self.len()
                ))
            })
    }

    pub fn criterion(&self, index: usize) -> Option<&CrossEntropyLabelSmooth> {
        self.criteria.0.get(index)
    }

    pub fn granularity(&self) -> &GranularitySpec {
        &self.spec.0
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Mean over heads of the label-smoothed CE of head k against labels k
    pub fn classification_loss(
        &self,
        logits: &[Tensor<B, 2>],
        labels: &[Tensor<B, 1, Int>],
    ) -> Result<Tensor<B, 1>> {
        let k = self.len();
        if logits.len() != k || labels.len() != k {
            return Err(UdaError::Config(format!(
                "bank has {} heads but got {} logits and {} label sets",
                k,
                logits.len(),
                labels.len()
            )));
        }

        let mut total: Option<Tensor<B, 1>> = None;
        for ((criterion, logits), labels) in self.criteria.0.iter().zip(logits).zip(labels) {
            let loss = criterion.forward(logits.clone(), labels.clone())?;
            total = Some(match total {
                Some(acc) => acc + loss,
                None => loss,
            });
        }

        total
            .map(|sum| sum.div_scalar(k as f32))
            .ok_or_else(|| UdaError::Config("classifier bank is empty".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, ElementConversion, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn labels(values: Vec<i64>) -> Tensor<TestBackend, 1, Int> {
        let n = values.len();
        Tensor::from_data(TensorData::new(values, [n]), &Default::default())
    }

    #[test]
    fn test_spec_validation() {
        assert!(GranularitySpec::new(vec![]).is_err());
        assert!(GranularitySpec::new(vec![5, 0]).is_err());

        let spec = GranularitySpec::new(vec![500, 700, 900]).unwrap();
        assert_eq!(spec.len(), 3);
        assert_eq!(spec.cluster_count(1), Some(700));
        assert_eq!(spec.cluster_count(3), None);
    }

    #[test]
    fn test_one_head_per_granularity_even_for_equal_counts() {
        let device = Default::default();
        let spec = GranularitySpec::new(vec![4, 4]).unwrap();
        let bank = ClassifierBank::<TestBackend>::new(&spec, 8, &device).unwrap();

        assert_eq!(bank.len(), 2);
        assert!(bank.heads.iter().all(|h| h.bias.is_none()));

        let w0: Vec<f32> = bank.heads[0].weight.val().into_data().to_vec().unwrap();
        let w1: Vec<f32> = bank.heads[1].weight.val().into_data().to_vec().unwrap();
        assert_ne!(w0, w1);
    }

    #[test]
    fn test_single_head_loss_equals_its_criterion() {
        let device = Default::default();
        let spec = GranularitySpec::new(vec![5]).unwrap();
        let bank = ClassifierBank::<TestBackend>::new(&spec, 6, &device).unwrap();

        let logits =
            Tensor::<TestBackend, 2>::random([4, 5], Distribution::Normal(0.0, 1.0), &device);
        let targets = labels(vec![0, 1, 4, 2]);

        let bank_loss: f32 = bank
            .classification_loss(&[logits.clone()], &[targets.clone()])
            .unwrap()
            .into_scalar()
            .elem();
        let direct: f32 = CrossEntropyLabelSmooth::new(5)
            .forward(logits, targets)
            .unwrap()
            .into_scalar()
            .elem();

        assert!((bank_loss - direct).abs() < 1e-6);
    }

    #[test]
    fn test_loss_is_mean_over_granularities() {
        let device = Default::default();
        let counts = vec![3, 5, 7];
        let spec = GranularitySpec::new(counts.clone()).unwrap();
        let bank = ClassifierBank::<TestBackend>::new(&spec, 6, &device).unwrap();

        let logits: Vec<_> = counts
            .iter()
            .map(|&c| {
                Tensor::<TestBackend, 2>::random([4, c], Distribution::Normal(0.0, 2.0), &device)
            })
            .collect();
        let targets = vec![
            labels(vec![0, 1, 2, 0]),
            labels(vec![4, 3, 2, 1]),
            labels(vec![6, 0, 5, 3]),
        ];

        let per_head: Vec<f32> = counts
            .iter()
            .enumerate()
            .map(|(k, &c)| {
                CrossEntropyLabelSmooth::new(c)
                    .forward(logits[k].clone(), targets[k].clone())
                    .unwrap()
                    .into_scalar()
                    .elem()
            })
            .collect();
        let expected = per_head.iter().sum::<f32>() / 3.0;

        let bank_loss: f32 = bank
            .classification_loss(&logits, &targets)
            .unwrap()
            .into_scalar()
            .elem();
        assert!((bank_loss - expected).abs() < 1e-5);
        assert!((bank_loss - per_head.iter().sum::<f32>()).abs() > 1e-3);
    }

    #[test]
    fn test_label_count_mismatch_is_config_error() {
        let device = Default::default();
        let spec = GranularitySpec::new(vec![3, 5]).unwrap();
        let bank = ClassifierBank::<TestBackend>::new(&spec, 6, &device).unwrap();
        let logits = bank.forward(Tensor::zeros([2, 6], &device));

        let err = bank
            .classification_loss(&logits, &[labels(vec![0, 1])])
            .unwrap_err();
        assert!(matches!(err, UdaError::Config(_)));
    }

    #[test]
    fn test_forward_head_out_of_range() {
        let device = Default::default();
        let spec = GranularitySpec::new(vec![3]).unwrap();
        let bank = ClassifierBank::<TestBackend>::new(&spec, 6, &device).unwrap();
        assert!(bank.forward_head(1, Tensor::zeros([2, 6], &device)).is_err());
        assert_eq!(bank.criterion(0).map(|c| c.num_classes()), Some(3));
    }
}
