//! Slippy-map tile dataset and batcher.
//!
//! A split directory holds one sub-directory per input channel plus a
//! `labels` directory, all sharing the same `{z}/{x}/{y}` tile set. The first
//! configured channel defines which tiles exist; every other channel and the
//! labels must provide each of them.

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Pixel};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    config::ChannelConfig,
    error::{RoboSatError, RoboSatResult},
    tiles::{tiles_from_slippy_map, Tile},
    transforms::{Band, JointCompose, JointTransform, Mask, Raster},
};

/// Name of the label sub-directory under each split.
pub const LABELS_DIR: &str = "labels";

/// One transformed sample, still host-side.
///
/// Follows Burn's convention: datasets yield raw data, the batcher builds
/// tensors on the target device.
#[derive(Debug, Clone)]
pub struct TileItem {
    /// Planar `[C, H, W]` image values.
    pub image: Vec<f32>,
    /// Row-major `[H, W]` class ids.
    pub mask: Vec<i64>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub tile: Tile,
}

#[derive(Debug, Clone)]
struct TileSources {
    tile: Tile,
    /// One file per configured channel, in configured order.
    channels: Vec<PathBuf>,
    label: PathBuf,
}

/// Aligned image/mask samples over one split of a tile dataset.
pub struct TileDataset {
    sources: Vec<TileSources>,
    bands: Vec<Vec<usize>>,
    transform: JointCompose,
    seed: u64,
    draws: AtomicU64,
}

impl TileDataset {
    /// Indexes `<root>/<split>` for the given channels.
    ///
    /// # Errors
    ///
    /// Returns `MissingTile` if any channel or label file is absent for a tile
    /// of the first channel, or `Configuration` if no channel is given.
    pub fn new(
        root: &Path,
        split: &str,
        channels: &[ChannelConfig],
        transform: JointCompose,
        seed: u64,
    ) -> RoboSatResult<Self> {
        let split_dir = root.join(split);
        let primary = channels
            .first()
            .ok_or_else(|| RoboSatError::configuration("at least one input channel is required"))?;

        let label_dir = split_dir.join(LABELS_DIR);
        let mut sources = Vec::new();

        for (tile, primary_path) in tiles_from_slippy_map(&split_dir.join(&primary.sub))? {
            let mut paths = Vec::with_capacity(channels.len());
            paths.push(primary_path);
            for channel in &channels[1..] {
                paths.push(locate(&tile, &split_dir.join(&channel.sub))?);
            }

            sources.push(TileSources {
                tile,
                channels: paths,
                label: locate(&tile, &label_dir)?,
            });
        }

        tracing::info!(
            split,
            tiles = sources.len(),
            channels = channels.len(),
            "Indexed tile dataset"
        );

        Ok(Self {
            sources,
            bands: channels.iter().map(|c| c.bands.clone()).collect(),
            transform,
            seed,
            draws: AtomicU64::new(0),
        })
    }

    /// The tile coordinates in index order.
    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        self.sources.iter().map(|s| s.tile)
    }

    /// Loads, assembles and transforms the sample at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tile cannot be decoded, a band index exceeds the
    /// file's channel count, or the channel tiles differ in size.
    pub fn try_get(&self, index: usize) -> RoboSatResult<Option<TileItem>> {
        let Some(source) = self.sources.get(index) else {
            return Ok(None);
        };

        let mut parts = Vec::new();
        for (path, bands) in source.channels.iter().zip(&self.bands) {
            parts.extend(load_bands(path, bands)?);
        }
        let expected = parts.first().map(Band::dimensions);
        let image = Raster::from_bands(parts).ok_or_else(|| {
            RoboSatError::shape(
                format!("channel tiles of {}", source.tile),
                expected,
                "tiles of differing size",
            )
        })?;
        let mask = load_label(&source.label)?;

        let mut rng = self.create_rng();
        let (image, mask) = self.transform.apply(image, mask, &mut rng);

        if image.dimensions() != mask.dimensions() {
            return Err(RoboSatError::shape(
                format!("transformed sample {}", source.tile),
                image.dimensions(),
                mask.dimensions(),
            ));
        }

        let (width, height) = image.dimensions();
        Ok(Some(TileItem {
            channels: image.channels(),
            height: height as usize,
            width: width as usize,
            image: image.into_planar(),
            mask: mask.into_raw().into_iter().map(i64::from).collect(),
            tile: source.tile,
        }))
    }

    fn create_rng(&self) -> StdRng {
        let draw = self.draws.fetch_add(1, Ordering::Relaxed);
        StdRng::seed_from_u64(self.seed.wrapping_add(draw))
    }
}

impl Dataset<TileItem> for TileDataset {
    fn get(&self, index: usize) -> Option<TileItem> {
        match self.try_get(index) {
            Ok(item) => item,
            Err(e) => {
                tracing::error!(index, error = %e, "Failed to load sample");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.sources.len()
    }
}

fn locate(tile: &Tile, dir: &Path) -> RoboSatResult<PathBuf> {
    tile.find_in(dir).ok_or_else(|| RoboSatError::MissingTile {
        tile: tile.to_string(),
        path: tile.stem_in(dir),
    })
}

fn open(path: &Path) -> RoboSatResult<DynamicImage> {
    image::open(path).map_err(|source| RoboSatError::Image {
        path: path.to_path_buf(),
        source,
    })
}

fn planes<P: Pixel<Subpixel = u8>>(buffer: &ImageBuffer<P, Vec<u8>>) -> Vec<GrayImage> {
    (0..usize::from(P::CHANNEL_COUNT))
        .map(|channel| {
            GrayImage::from_fn(buffer.width(), buffer.height(), |x, y| {
                Luma([buffer.get_pixel(x, y).channels()[channel]])
            })
        })
        .collect()
}

/// One 8-bit plane per pixel channel.
fn split_channels(image: DynamicImage) -> Vec<GrayImage> {
    match image.color().channel_count() {
        1 => planes(&image.into_luma8()),
        2 => planes(&image.into_luma_alpha8()),
        3 => planes(&image.into_rgb8()),
        _ => planes(&image.into_rgba8()),
    }
}

/// Reads the 1-based `bands` of one tile file.
fn load_bands(path: &Path, bands: &[usize]) -> RoboSatResult<Vec<Band>> {
    let planes = split_channels(open(path)?);

    bands
        .iter()
        .map(|&band| {
            band.checked_sub(1)
                .and_then(|index| planes.get(index))
                .map(Raster::band_from_gray)
                .ok_or_else(|| {
                    RoboSatError::shape(
                        format!("bands of {}", path.display()),
                        format!("1..={}", planes.len()),
                        band,
                    )
                })
        })
        .collect()
}

/// Reads class ids from the first channel of a label tile.
fn load_label(path: &Path) -> RoboSatResult<Mask> {
    split_channels(open(path)?)
        .into_iter()
        .next()
        .ok_or_else(|| RoboSatError::shape(format!("label {}", path.display()), "1 channel", 0))
}

/// A batch of samples on the device.
#[derive(Clone, Debug)]
pub struct TileBatch<B: Backend> {
    /// `[N, C, H, W]`
    pub images: Tensor<B, 4>,
    /// `[N, H, W]` class ids.
    pub masks: Tensor<B, 3, Int>,
    pub tiles: Vec<Tile>,
}

/// Stacks [`TileItem`]s into a [`TileBatch`].
#[derive(Clone, Default)]
pub struct TileBatcher<B: Backend> {
    _phantom: PhantomData<B>,
}

impl<B: Backend> TileBatcher<B> {
    pub const fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, TileItem, TileBatch<B>> for TileBatcher<B> {
    fn batch(&self, items: Vec<TileItem>, device: &B::Device) -> TileBatch<B> {
        let mut images = Vec::with_capacity(items.len());
        let mut masks = Vec::with_capacity(items.len());
        let mut tiles = Vec::with_capacity(items.len());

        for item in items {
            images.push(Tensor::<B, 3>::from_data(
                TensorData::new(item.image, [item.channels, item.height, item.width]),
                device,
            ));
            masks.push(Tensor::<B, 2, Int>::from_data(
                TensorData::new(item.mask, [item.height, item.width]),
                device,
            ));
            tiles.push(item.tile);
        }

        TileBatch {
            images: Tensor::stack(images, 0),
            masks: Tensor::stack(masks, 0),
            tiles,
        }
    }
}
