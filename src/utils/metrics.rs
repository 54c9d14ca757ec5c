//! Classification accuracy against (pseudo-)labels.

use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor};

/// Fraction of rows whose arg-max equals the target
pub fn top1_accuracy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> f64 {
    let [batch_size, _] = logits.dims();
    if batch_size == 0 {
        return 0.0;
    }

    let predictions = logits.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions.equal(targets).int().sum().into_scalar().elem();

    correct as f64 / batch_size as f64
}

/// Fraction of rows whose target is among the `k` highest logits
pub fn topk_accuracy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    k: usize,
) -> f64 {
    let [batch_size, num_classes] = logits.dims();
    if batch_size == 0 || k == 0 {
        return 0.0;
    }
    let k = k.min(num_classes);

    let (_, top) = logits.topk_with_indices(k, 1);
    let targets = targets.reshape([batch_size, 1]).expand([batch_size, k]);
    let hits = top.equal(targets).int().sum_dim(1).clamp_max(1);
    let correct: i64 = hits.sum().into_scalar().elem();

    correct as f64 / batch_size as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn logits(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 2> {
        Tensor::from_data(
            TensorData::new(
                vec![
                    0.9f32, 0.05, 0.05, //
                    0.1, 0.8, 0.1, //
                    0.2, 0.3, 0.5, //
                    0.6, 0.3, 0.1,
                ],
                [4, 3],
            ),
            device,
        )
    }

    #[test]
    fn test_three_of_four_correct() {
        let device = Default::default();
        let targets = Tensor::<TestBackend, 1, Int>::from_data(
            TensorData::new(vec![0i64, 1, 2, 2], [4]),
            &device,
        );

        let acc = top1_accuracy(logits(&device), targets);
        assert!((acc - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_topk_counts_second_choice() {
        let device = Default::default();
        let targets = Tensor::<TestBackend, 1, Int>::from_data(
            TensorData::new(vec![0i64, 1, 2, 1], [4]),
            &device,
        );

        // Last row ranks class 1 second.
        assert!((top1_accuracy(logits(&device), targets.clone()) - 0.75).abs() < 1e-12);
        assert!((topk_accuracy(logits(&device), targets, 2) - 1.0).abs() < 1e-12);
    }
}
