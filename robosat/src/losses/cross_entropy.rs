use burn::{nn::loss::CrossEntropyLossConfig as PixelCrossEntropyConfig, prelude::*};

use super::{flatten_pixels, SegmentationLoss};

/// Mean pixel-wise negative log-likelihood of the softmax.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

#[derive(Config, Debug)]
pub struct CrossEntropyLossConfig {}

impl CrossEntropyLossConfig {
    pub const fn init(&self) -> CrossEntropyLoss {
        CrossEntropyLoss
    }
}

impl<B: Backend> SegmentationLoss<B> for CrossEntropyLoss {
    fn forward(&self, logits: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Tensor<B, 1> {
        let (logits, targets) = flatten_pixels(logits, targets);
        PixelCrossEntropyConfig::new()
            .init(&logits.device())
            .forward(logits, targets)
    }
}
