//! U-Net decoder over a ResNet encoder.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use super::{
    encoder::{EncoderKind, ResNetEncoder},
    SegmentationModel,
};

const NUM_FILTERS: usize = 32;

/// 3x3 convolution followed by ReLU.
#[derive(Module, Debug)]
pub struct ConvRelu<B: Backend> {
    conv: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> ConvRelu<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.relu.forward(self.conv.forward(input))
    }
}

/// Nearest 2x upsampling then [`ConvRelu`].
#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    block: ConvRelu<B>,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            block: ConvRelu::new(in_channels, out_channels, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = input.dims();
        let up = interpolate(
            input,
            [h * 2, w * 2],
            InterpolateOptions::new(InterpolateMode::Nearest),
        );
        self.block.forward(up)
    }
}

/// Encoder features are concatenated into each decoder stage on the way up.
#[derive(Module, Debug)]
pub struct AlbuNet<B: Backend> {
    encoder: ResNetEncoder<B>,
    pool: MaxPool2d,
    center: DecoderBlock<B>,
    dec0: DecoderBlock<B>,
    dec1: DecoderBlock<B>,
    dec2: DecoderBlock<B>,
    dec3: DecoderBlock<B>,
    dec4: DecoderBlock<B>,
    head: Conv2d<B>,
}

impl<B: Backend> AlbuNet<B> {
    /// The center block sits below a stride-32 encoder and one more pooling.
    pub const INPUT_MULTIPLE: usize = 64;

    /// `kind` must be the depth `encoder` was built with.
    pub fn new(
        encoder: ResNetEncoder<B>,
        kind: EncoderKind,
        num_classes: usize,
        device: &B::Device,
    ) -> Self {
        let [w1, w2, w3, w4] = kind.widths();
        let f = NUM_FILTERS;

        Self {
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            center: DecoderBlock::new(w4, f * 8, device),
            dec0: DecoderBlock::new(w4 + f * 8, f * 8, device),
            dec1: DecoderBlock::new(w3 + f * 8, f * 8, device),
            dec2: DecoderBlock::new(w2 + f * 8, f * 2, device),
            dec3: DecoderBlock::new(w1 + f * 2, f * 4, device),
            dec4: DecoderBlock::new(f * 4, f, device),
            head: Conv2dConfig::new([f, num_classes], [1, 1]).init(device),
            encoder,
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, enc1, enc2, enc3, enc4] = self.encoder.forward(images);

        let center = self.center.forward(self.pool.forward(enc4.clone()));
        let dec0 = self.dec0.forward(Tensor::cat(vec![enc4, center], 1));
        let dec1 = self.dec1.forward(Tensor::cat(vec![enc3, dec0], 1));
        let dec2 = self.dec2.forward(Tensor::cat(vec![enc2, dec1], 1));
        let dec3 = self.dec3.forward(Tensor::cat(vec![enc1, dec2], 1));
        let dec4 = self.dec4.forward(dec3);

        self.head.forward(dec4)
    }
}

impl<B: Backend> SegmentationModel<B> for AlbuNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        AlbuNet::forward(self, images)
    }

    fn input_multiple(&self) -> usize {
        Self::INPUT_MULTIPLE
    }
}
