//! `RoboSat` training: semantic segmentation over slippy-map tile imagery.
//!
//! Tiles are assembled from configured channel bands, paired with label
//! tiles, transformed jointly and batched onto a Burn backend. Models and
//! losses are picked by name from a registry, and every epoch ends with a
//! checkpoint and a metrics summary.

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod logs;
pub mod losses;
pub mod metrics;
pub mod models;
pub mod plugins;
pub mod tiles;
pub mod training;
pub mod transforms;

#[cfg(test)]
mod tests;

#[doc(inline)]
pub use config::RoboSatConfig;
#[doc(inline)]
pub use error::{RoboSatError, RoboSatResult};
#[doc(inline)]
pub use metrics::Metrics;
#[doc(inline)]
pub use plugins::Plugins;
#[doc(inline)]
pub use training::{run, RunOptions, Trainer, TrainingOptions};
