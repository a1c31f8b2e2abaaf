//! Plain four-level U-Net.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use super::SegmentationModel;

const WIDTHS: [usize; 5] = [64, 128, 256, 512, 1024];

/// Two 3x3 convolution, batch norm and ReLU stages.
#[derive(Module, Debug)]
pub struct DoubleConv<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> DoubleConv<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = |cin| {
            Conv2dConfig::new([cin, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        Self {
            conv1: conv(in_channels),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv(out_channels),
            bn2: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(input)));
        self.relu.forward(self.bn2.forward(self.conv2.forward(out)))
    }
}

/// Transposed 2x upsampling, skip concatenation, then [`DoubleConv`].
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    up: ConvTranspose2d<B>,
    block: DoubleConv<B>,
}

impl<B: Backend> UpBlock<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            up: ConvTranspose2dConfig::new([in_channels, out_channels], [2, 2])
                .with_stride([2, 2])
                .init(device),
            block: DoubleConv::new(out_channels * 2, out_channels, device),
        }
    }

    fn forward(&self, input: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let up = self.up.forward(input);
        self.block.forward(Tensor::cat(vec![skip, up], 1))
    }
}

#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    down: Vec<DoubleConv<B>>,
    pool: MaxPool2d,
    up: Vec<UpBlock<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> UNet<B> {
    /// Four poolings halve the input side.
    pub const INPUT_MULTIPLE: usize = 16;

    pub fn new(num_channels: usize, num_classes: usize, device: &B::Device) -> Self {
        let mut down = Vec::with_capacity(WIDTHS.len());
        let mut previous = num_channels;
        for width in WIDTHS {
            down.push(DoubleConv::new(previous, width, device));
            previous = width;
        }

        let up = WIDTHS
            .windows(2)
            .rev()
            .map(|pair| UpBlock::new(pair[1], pair[0], device))
            .collect();

        Self {
            down,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            up,
            head: Conv2dConfig::new([WIDTHS[0], num_classes], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut skips = Vec::with_capacity(self.down.len());
        let mut out = images;
        for (level, block) in self.down.iter().enumerate() {
            if level > 0 {
                out = self.pool.forward(out);
            }
            out = block.forward(out);
            skips.push(out.clone());
        }

        // The deepest level feeds the first up block directly.
        skips.pop();
        for block in &self.up {
            let Some(skip) = skips.pop() else { break };
            out = block.forward(out, skip);
        }

        self.head.forward(out)
    }
}

impl<B: Backend> SegmentationModel<B> for UNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        UNet::forward(self, images)
    }

    fn input_multiple(&self) -> usize {
        Self::INPUT_MULTIPLE
    }
}
