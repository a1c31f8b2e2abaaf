//! ResNet feature encoder with a configurable number of input channels.

use core::{f64::consts::SQRT_2, str::FromStr};

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use crate::error::{RoboSatError, RoboSatResult};

const KAIMING: Initializer = Initializer::KaimingNormal {
    gain: SQRT_2,
    fan_out_only: true,
};

/// Supported encoder depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    ResNet18,
    ResNet34,
    ResNet50,
}

impl EncoderKind {
    pub const NAMES: [&'static str; 3] = ["resnet18", "resnet34", "resnet50"];

    pub const fn name(self) -> &'static str {
        match self {
            Self::ResNet18 => "resnet18",
            Self::ResNet34 => "resnet34",
            Self::ResNet50 => "resnet50",
        }
    }

    const fn blocks(self) -> [usize; 4] {
        match self {
            Self::ResNet18 => [2, 2, 2, 2],
            Self::ResNet34 | Self::ResNet50 => [3, 4, 6, 3],
        }
    }

    const fn expansion(self) -> usize {
        match self {
            Self::ResNet50 => 4,
            _ => 1,
        }
    }

    /// Output channels of the four residual stages.
    pub const fn widths(self) -> [usize; 4] {
        let e = self.expansion();
        [64 * e, 128 * e, 256 * e, 512 * e]
    }
}

impl FromStr for EncoderKind {
    type Err = RoboSatError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "resnet18" => Ok(Self::ResNet18),
            "resnet34" => Ok(Self::ResNet34),
            "resnet50" => Ok(Self::ResNet50),
            other => Err(RoboSatError::configuration(format!(
                "unknown encoder `{other}`, expected one of {:?}",
                Self::NAMES
            ))),
        }
    }
}

/// Stem and four residual stages; yields features at strides 4, 4, 8, 16 and 32.
#[derive(Module, Debug)]
pub struct ResNetEncoder<B: Backend> {
    stem: Stem<B>,
    layer1: LayerBlock<B>,
    layer2: LayerBlock<B>,
    layer3: LayerBlock<B>,
    layer4: LayerBlock<B>,
}

impl<B: Backend> ResNetEncoder<B> {
    pub fn new(kind: EncoderKind, in_channels: usize, device: &B::Device) -> Self {
        let blocks = kind.blocks();
        let widths = kind.widths();
        let bottleneck = kind.expansion() > 1;

        Self {
            stem: Stem::new(in_channels, 64, device),
            layer1: LayerBlock::new(blocks[0], 64, widths[0], 1, bottleneck, device),
            layer2: LayerBlock::new(blocks[1], widths[0], widths[1], 2, bottleneck, device),
            layer3: LayerBlock::new(blocks[2], widths[1], widths[2], 2, bottleneck, device),
            layer4: LayerBlock::new(blocks[3], widths[2], widths[3], 2, bottleneck, device),
        }
    }

    /// `[stem, stage1, stage2, stage3, stage4]`
    pub fn forward(&self, input: Tensor<B, 4>) -> [Tensor<B, 4>; 5] {
        let enc0 = self.stem.forward(input);
        let enc1 = self.layer1.forward(enc0.clone());
        let enc2 = self.layer2.forward(enc1.clone());
        let enc3 = self.layer3.forward(enc2.clone());
        let enc4 = self.layer4.forward(enc3.clone());
        [enc0, enc1, enc2, enc3, enc4]
    }

    /// Replaces the weights with the cached pretrained record for `kind`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the record is absent or unreadable and
    /// `ShapeMismatch` if its shapes differ, e.g. for a non-RGB stem.
    #[cfg(feature = "pretrained")]
    pub fn with_pretrained(self, kind: EncoderKind, device: &B::Device) -> RoboSatResult<Self> {
        use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};

        let path = dirs::cache_dir()
            .ok_or_else(|| RoboSatError::configuration("no cache directory on this platform"))?
            .join("robosat-burn")
            .join("encoders")
            .join(format!("{}.bin", kind.name()));
        if !path.is_file() {
            return Err(RoboSatError::configuration(format!(
                "pretrained weights not found at {}",
                path.display()
            )));
        }

        let recorder = BinFileRecorder::<FullPrecisionSettings>::default();
        let record: ResNetEncoderRecord<B> =
            recorder.load(path.clone(), device).map_err(|e| {
                RoboSatError::configuration(format!("cannot read {}: {e}", path.display()))
            })?;

        let restored = self.clone().load_record(record);
        crate::checkpoint::ensure_same_shapes(&self, &restored)?;
        tracing::info!(encoder = kind.name(), path = %path.display(), "Loaded pretrained encoder");
        Ok(restored)
    }

    #[cfg(not(feature = "pretrained"))]
    pub fn with_pretrained(self, kind: EncoderKind, _device: &B::Device) -> RoboSatResult<Self> {
        Err(RoboSatError::configuration(format!(
            "pretrained {} weights need the `pretrained` feature",
            kind.name()
        )))
    }
}

/// 7x7 stride-2 convolution, batch norm, ReLU and 3x3 stride-2 max pool.
#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> Stem<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .with_initializer(KAIMING)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        let out = self.relu.forward(self.bn.forward(out));
        self.pool.forward(out)
    }
}

fn conv_bn<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    device: &B::Device,
) -> (Conv2d<B>, BatchNorm<B, 2>) {
    let padding = kernel / 2;
    let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .with_initializer(KAIMING)
        .init(device);
    (conv, BatchNormConfig::new(out_channels).init(device))
}

#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    Basic(BasicBlock<B>),
    Bottleneck(Bottleneck<B>),
}

impl<B: Backend> ResidualBlock<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Basic(block) => block.forward(input),
            Self::Bottleneck(block) => block.forward(input),
        }
    }
}

/// Two 3x3 convolutions with an identity or projected shortcut.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    relu: Relu,
    shortcut: Option<Projection<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let (conv1, bn1) = conv_bn(in_channels, out_channels, 3, stride, device);
        let (conv2, bn2) = conv_bn(out_channels, out_channels, 3, 1, device);
        Self {
            conv1,
            bn1,
            conv2,
            bn2,
            relu: Relu::new(),
            shortcut: Projection::when_needed(in_channels, out_channels, stride, device),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(input.clone())));
        let out = self.bn2.forward(self.conv2.forward(out));
        let identity = match &self.shortcut {
            Some(projection) => projection.forward(input),
            None => input,
        };
        self.relu.forward(out + identity)
    }
}

/// 1x1, strided 3x3 and 1x1 convolutions with a 4x channel expansion.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    relu: Relu,
    shortcut: Option<Projection<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let inner = out_channels / 4;
        let (conv1, bn1) = conv_bn(in_channels, inner, 1, 1, device);
        let (conv2, bn2) = conv_bn(inner, inner, 3, stride, device);
        let (conv3, bn3) = conv_bn(inner, out_channels, 1, 1, device);
        Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            relu: Relu::new(),
            shortcut: Projection::when_needed(in_channels, out_channels, stride, device),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(input.clone())));
        let out = self.relu.forward(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));
        let identity = match &self.shortcut {
            Some(projection) => projection.forward(input),
            None => input,
        };
        self.relu.forward(out + identity)
    }
}

/// Strided 1x1 projection for shortcuts that change resolution or width.
#[derive(Module, Debug)]
pub struct Projection<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Projection<B> {
    fn when_needed(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        device: &B::Device,
    ) -> Option<Self> {
        (stride != 1 || in_channels != out_channels).then(|| {
            let (conv, bn) = conv_bn(in_channels, out_channels, 1, stride, device);
            Self { conv, bn }
        })
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(input))
    }
}

#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> LayerBlock<B> {
    fn new(
        num_blocks: usize,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        bottleneck: bool,
        device: &B::Device,
    ) -> Self {
        let blocks = (0..num_blocks)
            .map(|b| {
                let (cin, s) = if b == 0 {
                    (in_channels, stride)
                } else {
                    (out_channels, 1)
                };
                if bottleneck {
                    ResidualBlock::Bottleneck(Bottleneck::new(cin, out_channels, s, device))
                } else {
                    ResidualBlock::Basic(BasicBlock::new(cin, out_channels, s, device))
                }
            })
            .collect();
        Self { blocks }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |out, block| block.forward(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray<f32>;

    #[test]
    fn parses_known_encoders() {
        for name in EncoderKind::NAMES {
            let kind: EncoderKind = name.parse().expect("known encoder");
            assert_eq!(kind.name(), name);
        }
        assert!("resnet101".parse::<EncoderKind>().is_err());
    }

    #[test]
    fn resnet50_widths_are_expanded() {
        assert_eq!(EncoderKind::ResNet50.widths(), [256, 512, 1024, 2048]);
        assert_eq!(EncoderKind::ResNet34.widths(), [64, 128, 256, 512]);
    }

    #[test]
    fn feature_strides() {
        let device = Default::default();
        let encoder = ResNetEncoder::<TestBackend>::new(EncoderKind::ResNet18, 5, &device);
        let features = encoder.forward(Tensor::zeros([1, 5, 64, 64], &device));

        let dims: Vec<[usize; 4]> = features.iter().map(Tensor::dims).collect();
        assert_eq!(
            dims,
            vec![
                [1, 64, 16, 16],
                [1, 64, 16, 16],
                [1, 128, 8, 8],
                [1, 256, 4, 4],
                [1, 512, 2, 2],
            ]
        );
    }

    #[cfg(not(feature = "pretrained"))]
    #[test]
    fn pretrained_needs_feature() {
        let device = Default::default();
        let encoder = ResNetEncoder::<TestBackend>::new(EncoderKind::ResNet18, 3, &device);
        assert!(matches!(
            encoder.with_pretrained(EncoderKind::ResNet18, &device),
            Err(RoboSatError::Configuration { .. })
        ));
    }
}
