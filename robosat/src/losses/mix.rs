use burn::prelude::*;

use super::{CrossEntropyLoss, LovaszLoss, SegmentationLoss};

/// Cross entropy plus Lovász hinge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MixLoss {
    cross_entropy: CrossEntropyLoss,
    lovasz: LovaszLoss,
}

#[derive(Config, Debug)]
pub struct MixLossConfig {}

impl MixLossConfig {
    pub const fn init(&self) -> MixLoss {
        MixLoss {
            cross_entropy: CrossEntropyLoss,
            lovasz: LovaszLoss,
        }
    }
}

impl<B: Backend> SegmentationLoss<B> for MixLoss {
    fn forward(&self, logits: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Tensor<B, 1> {
        SegmentationLoss::<B>::forward(&self.cross_entropy, logits.clone(), targets.clone())
            + SegmentationLoss::<B>::forward(&self.lovasz, logits, targets)
    }
}
