//! Lovász hinge over one-hot targets.
//!
//! Errors are sorted on a detached copy; the sorted view is gathered back from
//! the live tensor so gradients flow through `select`. The Lovász extension
//! weights depend only on the sorted labels and are built host-side.

use burn::prelude::*;

use super::SegmentationLoss;

#[derive(Debug, Clone, Copy, Default)]
pub struct LovaszLoss;

#[derive(Config, Debug)]
pub struct LovaszLossConfig {}

impl LovaszLossConfig {
    pub const fn init(&self) -> LovaszLoss {
        LovaszLoss
    }
}

/// Gradient of the Lovász extension of the Jaccard loss at the sorted labels.
fn lovasz_grad(labels_sorted: &[f32]) -> Vec<f32> {
    let positives: f32 = labels_sorted.iter().sum();
    let mut seen_positive = 0.0;
    let mut seen_negative = 0.0;
    let mut previous = 0.0;

    labels_sorted
        .iter()
        .map(|&label| {
            seen_positive += label;
            seen_negative += 1.0 - label;
            let intersection = positives - seen_positive;
            let union = positives + seen_negative;
            let jaccard = 1.0 - intersection / union;
            let grad = jaccard - previous;
            previous = jaccard;
            grad
        })
        .collect()
}

impl<B: Backend> SegmentationLoss<B> for LovaszLoss {
    fn forward(&self, logits: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Tensor<B, 1> {
        let [n, k, h, w] = logits.dims();
        let device = logits.device();
        let pixels = h * w;
        let ids: Vec<i64> = targets.into_data().iter::<i64>().collect();

        let mut total = Tensor::<B, 1>::zeros([1], &device);
        for (sample, sample_ids) in ids.chunks(pixels).enumerate().take(n) {
            // One-hot in [K, H, W] order, matching the flattened logits.
            let one_hot: Vec<f32> = (0..k as i64)
                .flat_map(|class| sample_ids.iter().map(move |&id| f32::from(id == class)))
                .collect();
            let signs: Vec<f32> = one_hot.iter().map(|m| 2.0 * m - 1.0).collect();

            let scores = logits
                .clone()
                .slice([sample..sample + 1])
                .reshape([k * pixels]);
            let errors = Tensor::<B, 1>::from_data(TensorData::new(signs, [k * pixels]), &device)
                .mul(scores)
                .neg()
                .add_scalar(1.0);

            let order = errors.clone().detach().argsort_descending(0);
            let indices: Vec<i64> = order.to_data().iter::<i64>().collect();
            let labels_sorted: Vec<f32> = indices.iter().map(|&i| one_hot[i as usize]).collect();

            let grad = Tensor::<B, 1>::from_data(
                TensorData::new(lovasz_grad(&labels_sorted), [k * pixels]),
                &device,
            );
            let errors_sorted = errors.select(0, order);
            total = total + (errors_sorted.clamp_min(0.0) * grad).sum();
        }

        total.div_scalar(n.max(1) as f64)
    }
}
