use burn::{prelude::*, tensor::activation::log_softmax};

use super::{flatten_pixels, SegmentationLoss};

/// Cross entropy down-weighted by `(1 - p)^gamma` on well classified pixels.
#[derive(Debug, Clone, Copy)]
pub struct FocalLoss {
    gamma: f64,
}

#[derive(Config, Debug)]
pub struct FocalLossConfig {
    #[config(default = 2.0)]
    pub gamma: f64,
}

impl FocalLossConfig {
    pub const fn init(&self) -> FocalLoss {
        FocalLoss { gamma: self.gamma }
    }
}

impl<B: Backend> SegmentationLoss<B> for FocalLoss {
    fn forward(&self, logits: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Tensor<B, 1> {
        let (logits, targets) = flatten_pixels(logits, targets);
        let log_probs = log_softmax(logits, 1).gather(1, targets.unsqueeze_dim(1));
        let weights = log_probs
            .clone()
            .exp()
            .neg()
            .add_scalar(1.0)
            .powf_scalar(self.gamma);
        (weights * log_probs).mean().neg()
    }
}
