//! Segmentation networks selectable by name.

mod albunet;
mod encoder;
mod unet;

pub use albunet::{AlbuNet, DecoderBlock};
pub use encoder::{EncoderKind, ResNetEncoder};
pub use unet::UNet;

use burn::prelude::*;

use crate::error::RoboSatResult;

/// The forward contract the training driver relies on.
pub trait SegmentationModel<B: Backend> {
    /// Maps `[N, C, H, W]` images to `[N, K, H, W]` class logits.
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Input sides must be a multiple of this value.
    fn input_multiple(&self) -> usize {
        1
    }
}

/// Shape and metadata every model factory receives.
#[derive(Config, Debug)]
pub struct NetConfig {
    pub num_classes: usize,
    pub num_channels: usize,
    #[config(default = "String::from(\"resnet50\")")]
    pub encoder: String,
    #[config(default = false)]
    pub pretrained: bool,
}

impl NetConfig {
    /// Builds an [`AlbuNet`] over the configured ResNet encoder.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an unknown encoder or unavailable pretrained
    /// weights, `ShapeMismatch` if pretrained weights do not fit.
    pub fn init_albunet<B: Backend>(&self, device: &B::Device) -> RoboSatResult<Net<B>> {
        let kind: EncoderKind = self.encoder.parse()?;
        let encoder = ResNetEncoder::new(kind, self.num_channels, device);
        let encoder = if self.pretrained {
            encoder.with_pretrained(kind, device)?
        } else {
            encoder
        };
        Ok(Net::AlbuNet(AlbuNet::new(
            encoder,
            kind,
            self.num_classes,
            device,
        )))
    }

    /// Builds a plain [`UNet`]; the encoder setting is ignored.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if pretrained weights are requested.
    pub fn init_unet<B: Backend>(&self, device: &B::Device) -> RoboSatResult<Net<B>> {
        if self.pretrained {
            return Err(crate::error::RoboSatError::configuration(
                "unet has no pretrained encoder",
            ));
        }
        Ok(Net::UNet(UNet::new(
            self.num_channels,
            self.num_classes,
            device,
        )))
    }
}

/// Every built-in network.
#[derive(Module, Debug)]
pub enum Net<B: Backend> {
    AlbuNet(AlbuNet<B>),
    UNet(UNet<B>),
}

impl<B: Backend> SegmentationModel<B> for Net<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::AlbuNet(net) => net.forward(images),
            Self::UNet(net) => net.forward(images),
        }
    }

    fn input_multiple(&self) -> usize {
        match self {
            Self::AlbuNet(_) => AlbuNet::<B>::INPUT_MULTIPLE,
            Self::UNet(_) => UNet::<B>::INPUT_MULTIPLE,
        }
    }
}
