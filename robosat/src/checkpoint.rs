//! Per-epoch checkpoints of model and optimizer state.
//!
//! Each epoch writes its own file, `checkpoint-{epoch:05}-of-{total:05}.bin`.
//! Bytes go to a hidden sibling first and are renamed into place once synced,
//! so an existing checkpoint is never partially overwritten.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use burn::{
    module::{Module, ModuleVisitor, ParamId},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, PrecisionSettings, Record, Recorder},
};
use serde::{Deserialize, Serialize};

use crate::error::{RoboSatError, RoboSatResult};

/// Bumped whenever the record layout changes.
pub const FORMAT_VERSION: u32 = 1;

/// A decoded checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint<MR, OR> {
    /// Number of completed epochs.
    pub epoch: usize,
    pub model: MR,
    pub optimizer: OR,
}

/// The persisted record: version, epoch and both state records.
#[derive(Debug, Clone)]
pub struct CheckpointRecord<MR, OR> {
    pub format_version: u32,
    pub epoch: usize,
    pub model: MR,
    pub optimizer: OR,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointItem<MI, OI> {
    format_version: u32,
    epoch: usize,
    model: MI,
    optimizer: OI,
}

impl<B, MR, OR> Record<B> for CheckpointRecord<MR, OR>
where
    B: Backend,
    MR: Record<B>,
    OR: Record<B>,
{
    type Item<S: PrecisionSettings> = CheckpointItem<MR::Item<S>, OR::Item<S>>;

    fn into_item<S: PrecisionSettings>(self) -> Self::Item<S> {
        CheckpointItem {
            format_version: self.format_version,
            epoch: self.epoch,
            model: self.model.into_item(),
            optimizer: self.optimizer.into_item(),
        }
    }

    fn from_item<S: PrecisionSettings>(item: Self::Item<S>, device: &B::Device) -> Self {
        Self {
            format_version: item.format_version,
            epoch: item.epoch,
            model: MR::from_item(item.model, device),
            optimizer: OR::from_item(item.optimizer, device),
        }
    }
}

/// File name for the checkpoint written after `epoch` of `total` epochs.
pub fn checkpoint_name(epoch: usize, total: usize) -> String {
    format!("checkpoint-{epoch:05}-of-{total:05}.bin")
}

/// Path of that checkpoint inside `out`.
pub fn checkpoint_path(out: &Path, epoch: usize, total: usize) -> PathBuf {
    out.join(checkpoint_name(epoch, total))
}

/// Writes a checkpoint atomically.
///
/// # Errors
///
/// Returns `Recorder` if the state cannot be encoded and `Io` if the file
/// cannot be written.
pub fn save<B, MR, OR>(path: &Path, epoch: usize, model: MR, optimizer: OR) -> RoboSatResult<()>
where
    B: Backend,
    MR: Record<B>,
    OR: Record<B>,
{
    let record = CheckpointRecord {
        format_version: FORMAT_VERSION,
        epoch,
        model,
        optimizer,
    };
    let bytes = Recorder::<B>::record(&recorder(), record, ()).map_err(|e| {
        RoboSatError::Recorder {
            reason: e.to_string(),
        }
    })?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RoboSatError::io(parent, e))?;
    }

    let tmp = temporary_sibling(path);
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()
    };
    write().map_err(|e| RoboSatError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| RoboSatError::io(path, e))?;

    tracing::debug!(path = %path.display(), epoch, bytes = bytes.len(), "Saved checkpoint");
    Ok(())
}

/// Reads a checkpoint.
///
/// # Errors
///
/// Returns `Io` if the file cannot be read and `CorruptCheckpoint` if it does
/// not decode or carries an unknown format version.
pub fn load<B, MR, OR>(path: &Path, device: &B::Device) -> RoboSatResult<Checkpoint<MR, OR>>
where
    B: Backend,
    MR: Record<B>,
    OR: Record<B>,
{
    let bytes = fs::read(path).map_err(|e| RoboSatError::io(path, e))?;
    let record: CheckpointRecord<MR, OR> =
        Recorder::<B>::load(&recorder(), bytes, device).map_err(|e| {
            RoboSatError::CorruptCheckpoint {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

    if record.format_version != FORMAT_VERSION {
        return Err(RoboSatError::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason: format!(
                "format version {} is not supported, expected {FORMAT_VERSION}",
                record.format_version
            ),
        });
    }

    tracing::debug!(path = %path.display(), epoch = record.epoch, "Loaded checkpoint");
    Ok(Checkpoint {
        epoch: record.epoch,
        model: record.model,
        optimizer: record.optimizer,
    })
}

/// Loads `record` into `module`, refusing records whose parameter shapes differ.
///
/// # Errors
///
/// Returns `ShapeMismatch` naming the first differing parameter.
pub fn restore_module<B: Backend, M: Module<B>>(module: M, record: M::Record) -> RoboSatResult<M> {
    let reference = module.clone();
    let restored = module.load_record(record);
    ensure_same_shapes(&reference, &restored)?;
    Ok(restored)
}

/// Compares the float parameter shapes of two modules in visiting order.
///
/// # Errors
///
/// Returns `ShapeMismatch` if the parameter count or any shape differs.
pub fn ensure_same_shapes<B: Backend, M: Module<B>>(expected: &M, actual: &M) -> RoboSatResult<()> {
    let expected = parameter_shapes(expected);
    let actual = parameter_shapes(actual);

    if expected.len() != actual.len() {
        return Err(RoboSatError::shape(
            "parameter count",
            expected.len(),
            actual.len(),
        ));
    }

    match expected.iter().zip(&actual).position(|(e, a)| e != a) {
        Some(index) => Err(RoboSatError::shape(
            format!("parameter #{index}"),
            &expected[index],
            &actual[index],
        )),
        None => Ok(()),
    }
}

/// The epoch a resumed run starts at.
///
/// # Errors
///
/// Returns `Configuration` if the checkpoint already covers every epoch.
pub fn resume_epoch(checkpoint_epoch: usize, total: usize) -> RoboSatResult<usize> {
    if checkpoint_epoch >= total {
        return Err(RoboSatError::configuration(format!(
            "checkpoint epoch {checkpoint_epoch} already reaches the {total} configured epochs"
        )));
    }
    Ok(checkpoint_epoch)
}

/// Named MessagePack; decoding reports malformed input as an error.
fn recorder() -> NamedMpkBytesRecorder<FullPrecisionSettings> {
    NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
}

fn temporary_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "checkpoint".into(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.tmp"))
}

#[derive(Default)]
struct ShapeCollector {
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.shapes.push(tensor.dims().to_vec());
    }
}

fn parameter_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    let mut collector = ShapeCollector::default();
    module.visit(&mut collector);
    collector.shapes
}
