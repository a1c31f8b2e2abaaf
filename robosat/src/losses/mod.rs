//! Segmentation losses selectable by name.
//!
//! Losses hold no tensors, so one instance serves every backend: the
//! autodiff backend during training and its inner backend during validation.

mod cross_entropy;
mod focal;
mod lovasz;
mod mix;

pub use cross_entropy::{CrossEntropyLoss, CrossEntropyLossConfig};
pub use focal::{FocalLoss, FocalLossConfig};
pub use lovasz::{LovaszLoss, LovaszLossConfig};
pub use mix::{MixLoss, MixLossConfig};

use burn::{prelude::*, tensor::backend::AutodiffBackend};

/// Scalar loss over `[N, K, H, W]` logits and `[N, H, W]` class ids.
pub trait SegmentationLoss<B: Backend>: Send + Sync {
    fn forward(&self, logits: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Tensor<B, 1>;
}

/// A loss usable on both sides of an autodiff backend.
pub trait TrainingLoss<B: AutodiffBackend>:
    SegmentationLoss<B> + SegmentationLoss<B::InnerBackend>
{
}

impl<B, L> TrainingLoss<B> for L
where
    B: AutodiffBackend,
    L: SegmentationLoss<B> + SegmentationLoss<B::InnerBackend>,
{
}

/// One row per pixel: `[N*H*W, K]` logits and `[N*H*W]` class ids.
fn flatten_pixels<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
) -> (Tensor<B, 2>, Tensor<B, 1, Int>) {
    let [n, k, h, w] = logits.dims();
    let pixels = n * h * w;
    (
        logits.permute([0, 2, 3, 1]).reshape([pixels, k]),
        targets.reshape([pixels]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) type TestBackend = burn::backend::NdArray<f32>;
    pub(super) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;

    /// Two classes over a 1x2x2 image, logits strongly favouring `favoured`.
    pub(super) fn confident_logits<B: Backend>(
        favoured: [[i64; 2]; 2],
        device: &B::Device,
    ) -> (Tensor<B, 4>, Tensor<B, 3, Int>) {
        let fg = Tensor::<B, 2, Int>::from_data(favoured, device)
            .float()
            .mul_scalar(20.0)
            .sub_scalar(10.0);
        let logits = Tensor::stack::<3>(vec![fg.clone().neg(), fg], 0).unsqueeze::<4>();
        let targets = Tensor::<B, 2, Int>::from_data(favoured, device).unsqueeze::<3>();
        (logits, targets)
    }

    #[test]
    fn pixels_become_rows_in_raster_order() {
        let device = Default::default();
        // Class 0 scores 0..4, class 1 scores 10..14 over a 2x2 tile.
        let logits = Tensor::<TestBackend, 4>::from_data(
            [[[[0.0, 1.0], [2.0, 3.0]], [[10.0, 11.0], [12.0, 13.0]]]],
            &device,
        );
        let targets = Tensor::<TestBackend, 3, Int>::from_data([[[1, 0], [0, 1]]], &device);

        let (rows, ids) = flatten_pixels(logits, targets);
        assert_eq!(rows.dims(), [4, 2]);
        let rows: Vec<f32> = rows.into_data().to_vec().expect("f32 data");
        assert_eq!(rows, vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0, 3.0, 13.0]);
        let ids: Vec<i64> = ids.into_data().convert::<i64>().to_vec().expect("i64 data");
        assert_eq!(ids, vec![1, 0, 0, 1]);
    }
}
