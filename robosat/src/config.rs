//! Run configuration.
//!
//! The document is read once at start-up and never mutated during training.
//! It follows the RoboSat layout: a `model` section with the
//! hyper parameters, the dataset root, the ordered class titles and the
//! channel/band list that assembles the model input.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{RoboSatError, RoboSatResult};

/// Complete configuration of a training run.
#[derive(Config, Debug)]
pub struct RoboSatConfig {
    /// Model, loss and optimizer hyper parameters.
    pub model: ModelSection,
    /// Dataset location.
    pub dataset: DatasetSection,
    /// Class titles; index 0 is background-like.
    pub classes: ClassesSection,
    /// Ordered input channels.
    pub channels: Vec<ChannelConfig>,
}

/// Hyper parameters of the model and optimizer.
///
/// Only `name` and `loss` are required; omitted keys take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    /// Registered model name, e.g. `albunet`.
    pub name: String,
    /// Encoder identifier passed to the model factory.
    #[serde(default = "default_encoder")]
    pub encoder: String,
    /// Load pretrained encoder weights.
    #[serde(default)]
    pub pretrained: bool,
    /// Registered loss name, e.g. `lovasz`.
    pub loss: String,
    /// Learning rate.
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Adam weight decay.
    #[serde(default)]
    pub decay: f64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Side of the square tiles fed to the model.
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
    /// Random flip/rotate augmentation.
    #[serde(default = "default_true")]
    pub data_augmentation: bool,
}

fn default_encoder() -> String {
    String::from("resnet50")
}

const fn default_lr() -> f64 {
    0.000025
}

const fn default_epochs() -> usize {
    10
}

const fn default_batch_size() -> usize {
    4
}

const fn default_tile_size() -> u32 {
    512
}

const fn default_true() -> bool {
    true
}

impl ModelSection {
    /// A section with every hyper parameter at its default.
    pub fn new(name: String, loss: String) -> Self {
        Self {
            name,
            encoder: default_encoder(),
            pretrained: false,
            loss,
            lr: default_lr(),
            decay: 0.0,
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            tile_size: default_tile_size(),
            data_augmentation: default_true(),
        }
    }
}

/// Dataset location.
#[derive(Config, Debug)]
pub struct DatasetSection {
    /// Root holding `training/` and `validation/`.
    pub path: PathBuf,
}

/// Class titles.
#[derive(Config, Debug)]
pub struct ClassesSection {
    pub titles: Vec<String>,
}

/// One channel source: a sub-directory of tiles and the 1-based bands read from it.
#[derive(Config, Debug)]
pub struct ChannelConfig {
    /// Sub-directory under each split, e.g. `images`.
    pub sub: String,
    /// 1-based band indices into the tile's pixel channels.
    pub bands: Vec<usize>,
}

impl RoboSatConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> RoboSatResult<Self> {
        let path = path.as_ref();
        <Self as Config>::load(path).map_err(|e| {
            RoboSatError::configuration(format!("cannot load {}: {e}", path.display()))
        })
    }

    /// Saves this configuration to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> RoboSatResult<()> {
        let path = path.as_ref();
        <Self as Config>::save(self, path).map_err(|e| RoboSatError::io(path, e))
    }

    /// Number of output classes.
    pub fn num_classes(&self) -> usize {
        self.classes.titles.len()
    }

    /// Number of input channels, summed over every channel's bands.
    pub fn num_channels(&self) -> usize {
        self.channels.iter().map(|channel| channel.bands.len()).sum()
    }

    /// Title of the foreground class reported in the epoch summaries.
    pub fn foreground_title(&self) -> &str {
        self.classes
            .titles
            .get(1)
            .map_or("foreground", String::as_str)
    }

    /// Validate the configuration and return appropriate errors for invalid settings.
    ///
    /// # Errors
    ///
    /// Returns `Err(RoboSatError::Configuration)` if any rule is violated.
    pub fn validate(&self) -> RoboSatResult<()> {
        if self.num_classes() < 2 {
            return Err(RoboSatError::configuration(format!(
                "at least 2 class titles are required, got {}",
                self.num_classes()
            )));
        }

        if self.channels.is_empty() {
            return Err(RoboSatError::configuration(
                "at least one input channel is required",
            ));
        }

        for channel in &self.channels {
            if channel.bands.is_empty() {
                return Err(RoboSatError::configuration(format!(
                    "channel `{}` lists no bands",
                    channel.sub
                )));
            }
            if channel.bands.contains(&0) {
                return Err(RoboSatError::configuration(format!(
                    "channel `{}` bands are 1-based, got 0",
                    channel.sub
                )));
            }
        }

        let model = &self.model;
        if model.batch_size == 0 {
            return Err(RoboSatError::configuration("batch_size must be > 0"));
        }
        if model.tile_size == 0 {
            return Err(RoboSatError::configuration("tile_size must be > 0"));
        }
        if model.epochs == 0 {
            return Err(RoboSatError::configuration("epochs must be > 0"));
        }
        if !(model.lr > 0.0) {
            return Err(RoboSatError::configuration(format!(
                "learning rate must be positive, got {}",
                model.lr
            )));
        }
        if model.decay < 0.0 {
            return Err(RoboSatError::configuration(format!(
                "weight decay must not be negative, got {}",
                model.decay
            )));
        }

        Ok(())
    }
}
