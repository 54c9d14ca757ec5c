//! Loss terms used by both training regimes.
//!
//! - [`CrossEntropyLabelSmooth`]: classification against (pseudo-)labels with
//!   a smoothed target distribution
//! - [`SoftTripletLoss`]: batch-hard triplet objective relaxed through a
//!   softmax over (positive, negative) distances
//! - [`TripletLoss`]: classic hard-margin batch-hard triplet
//!
//! [`TripletCriterion`] picks one of the two triplet variants at construction
//! and exposes a single `(features, labels) -> scalar` call.

use burn::tensor::{
    activation::{log_softmax, relu, softmax},
    backend::Backend,
    ElementConversion, Int, Tensor,
};
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, UdaError};

/// Default label smoothing factor
pub const DEFAULT_LABEL_SMOOTHING: f32 = 0.1;

/// Offset that pushes excluded pairs out of the hard-mining max/min
const HARD_MINING_OFFSET: f32 = 9_999_999.0;

/// Label-smoothed cross-entropy bound to a fixed number of classes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossEntropyLabelSmooth {
    num_classes: usize,
    epsilon: f32,
}

impl CrossEntropyLabelSmooth {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            epsilon: DEFAULT_LABEL_SMOOTHING,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    /// `(-((1 - ε)·onehot + ε/C) · log_softmax(logits)).mean(0).sum()`
    ///
    /// Expanded as `(1 - ε)·NLL + (ε/C)·mean(-Σ_c log p_c)` so no one-hot
    /// tensor is materialised.
    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> Result<Tensor<B, 1>> {
        let [batch_size, num_classes] = logits.dims();
        if num_classes != self.num_classes {
            return Err(UdaError::ShapeMismatch(format!(
                "logits have {} classes, criterion expects {}",
                num_classes, self.num_classes
            )));
        }
        let [num_targets] = targets.dims();
        if batch_size == 0 || num_targets != batch_size {
            return Err(UdaError::ShapeMismatch(format!(
                "{} targets for a batch of {} logits",
                num_targets, batch_size
            )));
        }

        let lowest: i64 = targets.clone().min().into_scalar().elem();
        let highest: i64 = targets.clone().max().into_scalar().elem();
        if lowest < 0 || highest >= self.num_classes as i64 {
            return Err(UdaError::Config(format!(
                "labels span [{}, {}], criterion has {} classes",
                lowest, highest, self.num_classes
            )));
        }

        let log_probs = log_softmax(logits, 1);
        let nll = log_probs
            .clone()
            .gather(1, targets.reshape([batch_size, 1]))
            .neg()
            .mean();
        let uniform = log_probs.sum_dim(1).neg().mean();

        Ok(nll.mul_scalar(1.0 - self.epsilon)
            + uniform.mul_scalar(self.epsilon / num_classes as f32))
    }
}

/// Soft batch-hard triplet loss
///
/// With a margin `m` the loss is `mean(-m·log p_ap - (1-m)·log p_an)` where
/// `p = softmax(d_ap, d_an)`. Without a margin the target distribution comes
/// from the distances of the second embedding at the mined indices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftTripletLoss {
    margin: Option<f32>,
    normalize_feature: bool,
}

impl SoftTripletLoss {
    pub fn new(margin: Option<f32>) -> Self {
        Self {
            margin,
            normalize_feature: false,
        }
    }

    pub fn with_normalized_features(mut self, normalize_feature: bool) -> Self {
        self.normalize_feature = normalize_feature;
        self
    }

    pub fn margin(&self) -> Option<f32> {
        self.margin
    }

    pub fn forward<B: Backend>(
        &self,
        emb1: Tensor<B, 2>,
        emb2: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
    ) -> Result<Tensor<B, 1>> {
        check_rows(&emb1, &labels)?;
        check_rows(&emb2, &labels)?;

        let (emb1, emb2) = if self.normalize_feature {
            (l2_normalize(emb1), l2_normalize(emb2))
        } else {
            (emb1, emb2)
        };

        let dist = euclidean_dist(emb1.clone(), emb1);
        let hard = batch_hard(dist, same_label_mask(labels));
        let log_p = log_softmax(Tensor::cat(vec![hard.dist_ap, hard.dist_an], 1), 1);

        if let Some(margin) = self.margin {
            let lp_ap = log_p.clone().narrow(1, 0, 1);
            let lp_an = log_p.narrow(1, 1, 1);
            return Ok((lp_ap.mul_scalar(-margin) - lp_an.mul_scalar(1.0 - margin)).mean());
        }

        let dist_ref = euclidean_dist(emb2.clone(), emb2);
        let ap_ref = dist_ref.clone().gather(1, hard.ap_idx);
        let an_ref = dist_ref.gather(1, hard.an_idx);
        let reference = softmax(Tensor::cat(vec![ap_ref, an_ref], 1), 1).detach();

        Ok((reference.neg() * log_p).mean_dim(0).sum())
    }
}

/// Hard-margin batch-hard triplet loss
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TripletLoss {
    margin: f32,
    normalize_feature: bool,
}

impl TripletLoss {
    pub fn new(margin: f32) -> Self {
        Self {
            margin,
            normalize_feature: false,
        }
    }

    pub fn with_normalized_features(mut self, normalize_feature: bool) -> Self {
        self.normalize_feature = normalize_feature;
        self
    }

    /// Returns the loss and the fraction of anchors whose hardest negative is
    /// farther than their hardest positive.
    pub fn forward<B: Backend>(
        &self,
        emb: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
    ) -> Result<(Tensor<B, 1>, f64)> {
        let [batch_size] = check_rows(&emb, &labels)?;

        let emb = if self.normalize_feature {
            l2_normalize(emb)
        } else {
            emb
        };

        let dist = euclidean_dist(emb.clone(), emb);
        let hard = batch_hard(dist, same_label_mask(labels));

        let separated: i64 = hard
            .dist_an
            .clone()
            .greater(hard.dist_ap.clone())
            .int()
            .sum()
            .into_scalar()
            .elem();
        let precision = separated as f64 / batch_size as f64;

        let loss = relu((hard.dist_ap - hard.dist_an).add_scalar(self.margin)).mean();
        Ok((loss, precision))
    }
}

/// Triplet variant selected when a trainer is built
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripletCriterion {
    Soft(SoftTripletLoss),
    Hard(TripletLoss),
}

impl TripletCriterion {
    pub fn soft(margin: Option<f32>) -> Self {
        TripletCriterion::Soft(SoftTripletLoss::new(margin))
    }

    pub fn hard(margin: f32) -> Self {
        TripletCriterion::Hard(TripletLoss::new(margin))
    }

    /// Consistency loss of a feature batch against itself, grouped by `labels`
    pub fn forward<B: Backend>(
        &self,
        features: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
    ) -> Result<Tensor<B, 1>> {
        match self {
            TripletCriterion::Soft(loss) => loss.forward(features.clone(), features, labels),
            TripletCriterion::Hard(loss) => loss.forward(features, labels).map(|(loss, _)| loss),
        }
    }
}

impl Default for TripletCriterion {
    fn default() -> Self {
        TripletCriterion::soft(Some(0.0))
    }
}

/// Pairwise euclidean distances, clamped away from zero before the sqrt
pub fn euclidean_dist<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
    let [m, _] = x.dims();
    let [n, _] = y.dims();

    let xx = x.clone().powf_scalar(2.0).sum_dim(1).expand([m, n]);
    let yy = y
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .reshape([1, n])
        .expand([m, n]);
    let xy = x.matmul(y.transpose());

    (xx + yy - xy.mul_scalar(2.0)).clamp_min(1e-12).sqrt()
}

/// Row-wise L2 normalisation
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, d] = x.dims();
    let norm = x
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .clamp_min(1e-12)
        .expand([n, d]);
    x / norm
}

struct HardPairs<B: Backend> {
    dist_ap: Tensor<B, 2>,
    dist_an: Tensor<B, 2>,
    ap_idx: Tensor<B, 2, Int>,
    an_idx: Tensor<B, 2, Int>,
}

/// Farthest positive and nearest negative per anchor
fn batch_hard<B: Backend>(dist: Tensor<B, 2>, same: Tensor<B, 2>) -> HardPairs<B> {
    let positives = dist.clone()
        - same
            .clone()
            .neg()
            .add_scalar(1.0)
            .mul_scalar(HARD_MINING_OFFSET);
    let (dist_ap, ap_idx) = positives.max_dim_with_indices(1);

    let negatives = dist + same.mul_scalar(HARD_MINING_OFFSET);
    let (dist_an, an_idx) = negatives.min_dim_with_indices(1);

    HardPairs {
        dist_ap,
        dist_an,
        ap_idx,
        an_idx,
    }
}

/// 1.0 where two samples share a label
fn same_label_mask<B: Backend>(labels: Tensor<B, 1, Int>) -> Tensor<B, 2> {
    let [n] = labels.dims();
    let rows = labels.clone().reshape([n, 1]).expand([n, n]);
    let cols = labels.reshape([1, n]).expand([n, n]);
    rows.equal(cols).float()
}

fn check_rows<B: Backend>(emb: &Tensor<B, 2>, labels: &Tensor<B, 1, Int>) -> Result<[usize; 1]> {
    let [rows, _] = emb.dims();
    let [num_labels] = labels.dims();
    if rows == 0 || rows != num_labels {
        return Err(UdaError::ShapeMismatch(format!(
            "{} embeddings for {} labels",
            rows, num_labels
        )));
    }
    Ok([rows])
}
