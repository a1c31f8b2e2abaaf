use std::path::PathBuf;

use thiserror::Error;

/// The error type for `robosat-burn` operations.
///
/// Every variant is fatal to a training run: the pipeline is deterministic, so
/// nothing here is retried.
#[derive(Error, Debug)]
pub enum RoboSatError {
    /// The resolved configuration cannot produce a meaningful run.
    #[error("Invalid configuration: {reason}")]
    Configuration {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// A model or loss name is not present in the plugin registry.
    #[error("Unknown {kind} `{name}`, those available are {available:?}")]
    UnknownPlugin {
        /// Either `"model"` or `"loss"`.
        kind: &'static str,
        /// The configured name.
        name: String,
        /// Every registered name of that kind, sorted.
        available: Vec<String>,
    },

    /// Image, mask, prediction or parameter dimensions disagree.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// The expected shape or value.
        expected: String,
        /// The actual shape or value.
        actual: String,
    },

    /// A training or validation pass saw zero samples.
    #[error("Dataset for the {phase} pass contains no samples")]
    EmptyDataset {
        /// `"train"` or `"validate"`.
        phase: &'static str,
    },

    /// A pass yielded fewer samples than its dataset holds: a tile failed to load.
    #[error("The {phase} pass yielded {actual} of {expected} samples, see the log for the failing tile")]
    IncompletePass {
        /// `"train"` or `"validate"`.
        phase: &'static str,
        /// Samples in the dataset.
        expected: usize,
        /// Samples that reached the model.
        actual: usize,
    },

    /// A band or label tile is absent for a coordinate of the primary channel.
    #[error("Missing tile {tile}: expected a file at {}", path.display())]
    MissingTile {
        /// The tile coordinate, formatted as `z/x/y`.
        tile: String,
        /// The directory or file stem that was searched.
        path: PathBuf,
    },

    /// A checkpoint record could not be parsed or is structurally invalid.
    #[error("Corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint {
        /// The checkpoint file.
        path: PathBuf,
        /// What failed while decoding.
        reason: String,
    },

    /// Filesystem access failed.
    #[error("I/O error on {}", path.display())]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A tile could not be decoded.
    #[error("Failed to decode image {}", path.display())]
    Image {
        /// The tile file.
        path: PathBuf,
        /// The underlying image error.
        #[source]
        source: image::ImageError,
    },

    /// Serializing a record failed.
    #[error("Failed to record state: {reason}")]
    Recorder {
        /// The recorder's error message.
        reason: String,
    },
}

impl RoboSatError {
    /// Configuration errors: an unusable setting, unknown plugin, or a resume target already met.
    pub const fn is_configuration_error(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::UnknownPlugin { .. })
    }

    /// Whether the process must stop. Every variant is fatal.
    pub const fn is_fatal(&self) -> bool {
        true
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(
        context: impl Into<String>,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A specialized `Result` type for `robosat-burn` operations.
pub type RoboSatResult<T> = Result<T, RoboSatError>;
