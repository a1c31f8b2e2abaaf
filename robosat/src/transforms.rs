//! Paired image and mask transforms.
//!
//! Geometric stages run `image::imageops` on every band and on the mask with
//! one shared operation, so the two never drift apart. Bands keep `f32`
//! samples; the mask keeps its 8-bit class ids.

use image::{
    imageops::{self, FilterType},
    GrayImage, ImageBuffer, Luma, Pixel,
};
use rand::{rngs::StdRng, Rng};

/// ImageNet channel means for the three visual bands.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations for the three visual bands.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One input band.
pub type Band = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Per-pixel class ids.
pub type Mask = GrayImage;

/// Equally sized bands, in channel order.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    bands: Vec<Band>,
}

impl Raster {
    /// `None` when `bands` is empty or the bands differ in size.
    pub fn from_bands(bands: Vec<Band>) -> Option<Self> {
        let first = bands.first()?.dimensions();
        bands
            .iter()
            .all(|band| band.dimensions() == first)
            .then_some(Self { bands })
    }

    /// Widens 8-bit samples without rescaling them.
    pub fn band_from_gray(plane: &GrayImage) -> Band {
        ImageBuffer::from_fn(plane.width(), plane.height(), |x, y| {
            Luma([f32::from(plane.get_pixel(x, y)[0])])
        })
    }

    pub fn channels(&self) -> usize {
        self.bands.len()
    }

    /// `(width, height)`, as `image` orders them.
    pub fn dimensions(&self) -> (u32, u32) {
        self.bands.first().map_or((0, 0), Band::dimensions)
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    /// Planar `[C, H, W]` samples.
    pub fn into_planar(self) -> Vec<f32> {
        self.bands.into_iter().flat_map(ImageBuffer::into_raw).collect()
    }

    fn map_bands(self, f: impl Fn(&Band) -> Band) -> Self {
        Self {
            bands: self.bands.iter().map(f).collect(),
        }
    }
}

/// A stage acting on an image and its mask together.
pub trait JointTransform: Send + Sync {
    fn apply(&self, image: Raster, mask: Mask, rng: &mut StdRng) -> (Raster, Mask);
}

/// A stage acting on the image only.
pub trait ImageTransform: Send + Sync {
    fn apply(&self, image: Raster) -> Raster;
}

/// Lifts an image-only stage into the joint pipeline; the mask passes through.
pub struct ImageOnly<T>(pub T);

impl<T: ImageTransform> JointTransform for ImageOnly<T> {
    fn apply(&self, image: Raster, mask: Mask, _rng: &mut StdRng) -> (Raster, Mask) {
        (self.0.apply(image), mask)
    }
}

/// Runs stages in order.
#[derive(Default)]
pub struct JointCompose {
    stages: Vec<Box<dyn JointTransform>>,
}

impl JointCompose {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn then(mut self, stage: impl JointTransform + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl JointTransform for JointCompose {
    fn apply(&self, image: Raster, mask: Mask, rng: &mut StdRng) -> (Raster, Mask) {
        self.stages
            .iter()
            .fold((image, mask), |(image, mask), stage| stage.apply(image, mask, rng))
    }
}

/// Resizes both to a square side: bilinear for the bands, nearest for the mask.
#[derive(Debug, Clone, Copy)]
pub struct JointResize {
    pub size: u32,
}

impl JointResize {
    pub const fn new(size: u32) -> Self {
        Self { size }
    }
}

impl JointTransform for JointResize {
    fn apply(&self, image: Raster, mask: Mask, _rng: &mut StdRng) -> (Raster, Mask) {
        let side = self.size;
        (
            image.map_bands(|band| imageops::resize(band, side, side, FilterType::Triangle)),
            imageops::resize(&mask, side, side, FilterType::Nearest),
        )
    }
}

/// The dihedral operations drawn by [`JointRandomFlipOrRotate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipOrRotate {
    Identity,
    FlipHorizontal,
    FlipVertical,
    /// Clockwise quarter turn.
    Rotate90,
    Rotate180,
    Rotate270,
}

impl FlipOrRotate {
    pub const ALL: [Self; 6] = [
        Self::Identity,
        Self::FlipHorizontal,
        Self::FlipVertical,
        Self::Rotate90,
        Self::Rotate180,
        Self::Rotate270,
    ];

    fn on<P: Pixel + 'static>(
        self,
        buffer: &ImageBuffer<P, Vec<P::Subpixel>>,
    ) -> ImageBuffer<P, Vec<P::Subpixel>> {
        match self {
            Self::Identity => buffer.clone(),
            Self::FlipHorizontal => imageops::flip_horizontal(buffer),
            Self::FlipVertical => imageops::flip_vertical(buffer),
            Self::Rotate90 => imageops::rotate90(buffer),
            Self::Rotate180 => imageops::rotate180(buffer),
            Self::Rotate270 => imageops::rotate270(buffer),
        }
    }

    pub fn apply(self, image: Raster, mask: Mask) -> (Raster, Mask) {
        if self == Self::Identity {
            return (image, mask);
        }
        (image.map_bands(|band| self.on(band)), self.on(&mask))
    }
}

/// Draws one of [`FlipOrRotate::ALL`] uniformly and applies it to both.
#[derive(Debug, Clone, Copy)]
pub struct JointRandomFlipOrRotate {
    pub enabled: bool,
}

impl JointTransform for JointRandomFlipOrRotate {
    fn apply(&self, image: Raster, mask: Mask, rng: &mut StdRng) -> (Raster, Mask) {
        if !self.enabled {
            return (image, mask);
        }
        let op = FlipOrRotate::ALL[rng.random_range(0..FlipOrRotate::ALL.len())];
        op.apply(image, mask)
    }
}

/// Rescales 8-bit image values to `[0, 1]`. Mask ids stay as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageToTensor;

impl ImageTransform for ImageToTensor {
    fn apply(&self, mut image: Raster) -> Raster {
        for band in &mut image.bands {
            band.iter_mut().for_each(|v| *v /= 255.0);
        }
        image
    }
}

/// Per-band `(x - mean) / std` over the leading bands; later bands are untouched.
#[derive(Debug, Clone)]
pub struct Normalize {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalize {
    pub fn imagenet() -> Self {
        Self {
            mean: IMAGENET_MEAN.to_vec(),
            std: IMAGENET_STD.to_vec(),
        }
    }
}

impl ImageTransform for Normalize {
    fn apply(&self, mut image: Raster) -> Raster {
        for ((band, &mean), &std) in image.bands.iter_mut().zip(&self.mean).zip(&self.std) {
            band.iter_mut().for_each(|v| *v = (*v - mean) / std);
        }
        image
    }
}

/// The training pipeline: resize, optional flip/rotate, scale, normalize.
pub fn pipeline(tile_size: u32, augmentation: bool) -> JointCompose {
    JointCompose::new()
        .then(JointResize::new(tile_size))
        .then(JointRandomFlipOrRotate {
            enabled: augmentation,
        })
        .then(ImageOnly(ImageToTensor))
        .then(ImageOnly(Normalize::imagenet()))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn raster(width: u32, height: u32, values: &[f32]) -> Raster {
        let band = Band::from_raw(width, height, values.to_vec()).expect("band size");
        Raster::from_bands(vec![band]).expect("one band")
    }

    fn mask(width: u32, height: u32, ids: &[u8]) -> Mask {
        Mask::from_raw(width, height, ids.to_vec()).expect("mask size")
    }

    // Band 0 carries the pixel index, the mask carries the same index mod 251.
    fn tagged_pair(width: u32, height: u32) -> (Raster, Mask) {
        let index = move |x: u32, y: u32| y * width + x;
        let bands = vec![
            Band::from_fn(width, height, |x, y| Luma([index(x, y) as f32])),
            Band::from_fn(width, height, |x, y| Luma([(width * height - index(x, y)) as f32])),
        ];
        let image = Raster::from_bands(bands).expect("equal bands");
        let mask = Mask::from_fn(width, height, |x, y| Luma([(index(x, y) % 251) as u8]));
        (image, mask)
    }

    fn assert_aligned(image: &Raster, mask: &Mask) {
        assert_eq!(image.dimensions(), mask.dimensions());
        for (value, id) in image.bands()[0].iter().zip(mask.iter()) {
            assert_eq!((*value as u32 % 251) as u8, *id);
        }
    }

    #[test]
    fn every_flip_or_rotation_keeps_pixels_aligned() {
        for op in FlipOrRotate::ALL {
            let (image, mask) = tagged_pair(5, 3);
            let (image, mask) = op.apply(image, mask);
            assert_aligned(&image, &mask);
            assert_eq!(image.channels(), 2);
        }
    }

    #[test]
    fn rotate_90_is_clockwise() {
        // 1 2
        // 3 4
        let image = raster(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let labels = mask(2, 2, &[1, 2, 3, 4]);

        let (image, labels) = FlipOrRotate::Rotate90.apply(image, labels);
        assert_eq!(image.into_planar(), vec![3.0, 1.0, 4.0, 2.0]);
        assert_eq!(labels.into_raw(), vec![3, 1, 4, 2]);
    }

    #[test]
    fn non_square_rotation_swaps_sides() {
        let (image, mask) = tagged_pair(4, 2);
        let (image, mask) = FlipOrRotate::Rotate270.apply(image, mask);
        assert_eq!(image.dimensions(), (2, 4));
        assert_eq!(mask.dimensions(), (2, 4));
    }

    #[test]
    fn random_draw_is_shared_by_image_and_mask() {
        let stage = JointRandomFlipOrRotate { enabled: true };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..24 {
            let (image, mask) = tagged_pair(4, 4);
            let (image, mask) = stage.apply(image, mask, &mut rng);
            assert_aligned(&image, &mask);
        }
    }

    #[test]
    fn disabled_augmentation_is_identity() {
        let stage = JointRandomFlipOrRotate { enabled: false };
        let mut rng = StdRng::seed_from_u64(1);
        let (image, mask) = tagged_pair(3, 3);
        let (out_image, out_mask) = stage.apply(image.clone(), mask.clone(), &mut rng);
        assert_eq!(out_image, image);
        assert_eq!(out_mask, mask);
    }

    #[test]
    fn nearest_resize_never_invents_class_ids() {
        let image = raster(2, 2, &[0.0, 10.0, 20.0, 30.0]);
        let labels = mask(2, 2, &[0, 1, 2, 3]);
        let mut rng = StdRng::seed_from_u64(0);

        let (image, labels) = JointResize::new(4).apply(image, labels, &mut rng);
        assert_eq!(
            labels.into_raw(),
            vec![0, 0, 1, 1, 0, 0, 1, 1, 2, 2, 3, 3, 2, 2, 3, 3]
        );
        let values = image.into_planar();
        assert_eq!(values.len(), 16);
        assert!(values.iter().all(|v| (0.0..=30.0).contains(v)));
        assert!(values[0].abs() < 1e-4);
        assert!((values[15] - 30.0).abs() < 1e-4);
    }

    #[test]
    fn downscaled_quadrants_keep_their_ids() {
        // 4x4 made of four uniform 2x2 quadrants.
        let ids = [0u8, 0, 1, 1, 0, 0, 1, 1, 2, 2, 3, 3, 2, 2, 3, 3];
        let values: Vec<f32> = ids.iter().map(|&i| f32::from(i)).collect();
        let mut rng = StdRng::seed_from_u64(0);

        let (image, labels) =
            JointResize::new(2).apply(raster(4, 4, &values), mask(4, 4, &ids), &mut rng);
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(labels.into_raw(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn normalize_touches_only_visual_bands() {
        let white = Band::from_pixel(1, 1, Luma([255.0]));
        let image = Raster::from_bands(vec![white; 4]).expect("equal bands");
        let labels = mask(1, 1, &[3]);
        let mut rng = StdRng::seed_from_u64(0);

        let (image, labels) = pipeline(1, false).apply(image, labels, &mut rng);
        let values = image.into_planar();
        for band in 0..3 {
            let expected = (1.0 - IMAGENET_MEAN[band]) / IMAGENET_STD[band];
            assert!((values[band] - expected).abs() < 1e-6);
        }
        assert_eq!(values[3], 1.0);
        assert_eq!(labels.into_raw(), vec![3]);
    }

    #[test]
    fn bands_must_share_one_size() {
        let small = Band::new(2, 2);
        let large = Band::new(3, 3);
        assert!(Raster::from_bands(vec![small.clone(), large]).is_none());
        assert!(Raster::from_bands(Vec::new()).is_none());

        let joined = Raster::from_bands(vec![small.clone(), small]).expect("same size");
        assert_eq!(joined.channels(), 2);
        assert_eq!(joined.into_planar().len(), 8);
    }

    #[test]
    fn gray_planes_widen_without_rescaling() {
        let plane = GrayImage::from_raw(2, 1, vec![20, 255]).expect("plane size");
        assert_eq!(Raster::band_from_gray(&plane).into_raw(), vec![20.0, 255.0]);
    }
}
