//! Epoch loop: train, validate, checkpoint.
//!
//! The driver moves through `Idle -> Initializing -> (TrainEpoch ->
//! ValidateEpoch -> CheckpointEpoch)* -> Done`. Training steps run the
//! autodiff module; validation runs its inner module, so no graph is built.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};

use crate::{
    checkpoint::{self, resume_epoch, Checkpoint},
    config::RoboSatConfig,
    dataset::{TileBatch, TileBatcher, TileDataset},
    error::{RoboSatError, RoboSatResult},
    logs::{LogSink, Logs},
    losses::{SegmentationLoss, TrainingLoss},
    metrics::Metrics,
    models::{Net, NetConfig, SegmentationModel},
    plugins::Plugins,
    transforms::pipeline,
};

/// Seed for the training loader's shuffling and the augmentation draws.
pub const SEED: u64 = 42;

/// Where the driver is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Initializing,
    TrainEpoch,
    ValidateEpoch,
    CheckpointEpoch,
    Done,
}

/// Settings the driver needs beyond the model, optimizer and loss.
#[derive(Config, Debug)]
pub struct TrainingOptions {
    pub num_classes: usize,
    /// Total number of epochs, counted from zero even when resuming.
    pub epochs: usize,
    pub learning_rate: f64,
    /// Directory receiving checkpoints.
    pub out: PathBuf,
    /// Progress is traced every this many batches.
    #[config(default = 10)]
    pub log_every: usize,
    /// Title of class 1 in the summary lines.
    #[config(default = "String::from(\"foreground\")")]
    pub foreground_title: String,
}

/// Aggregates of one train or validation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    /// Sample-weighted mean of the batch losses.
    pub loss: f64,
    pub miou: f64,
    pub fg_iou: f64,
    pub mcc: f64,
    pub samples: usize,
}

impl EpochStats {
    fn summary(&self, label: &str, foreground: &str) -> String {
        format!(
            "{label} loss: {:.4}, mIoU: {:.3}, {foreground} IoU: {:.3}, MCC: {:.3}",
            self.loss, self.miou, self.fg_iou, self.mcc
        )
    }
}

/// What one completed epoch produced.
#[derive(Debug, Clone)]
pub struct EpochReport {
    /// 1-based epoch number.
    pub epoch: usize,
    pub train: EpochStats,
    pub validate: EpochStats,
    pub checkpoint: PathBuf,
}

/// Running loss and confusion matrix of a pass.
struct EpochAccumulator {
    phase: &'static str,
    loss_sum: f64,
    samples: usize,
    batches: usize,
    metrics: Metrics,
}

impl EpochAccumulator {
    fn new(phase: &'static str, num_classes: usize) -> Self {
        Self {
            phase,
            loss_sum: 0.0,
            samples: 0,
            batches: 0,
            metrics: Metrics::new(num_classes),
        }
    }

    fn add<B: Backend>(
        &mut self,
        loss: f64,
        masks: Tensor<B, 3, Int>,
        outputs: Tensor<B, 4>,
    ) -> RoboSatResult<()> {
        let n = masks.dims()[0];
        self.metrics.add_batch(masks, outputs)?;
        self.loss_sum += loss * n as f64;
        self.samples += n;
        self.batches += 1;
        Ok(())
    }

    fn running_loss(&self) -> f64 {
        self.loss_sum / self.samples.max(1) as f64
    }

    /// `expected` is the loader's item count; a shorter pass means samples were dropped.
    fn finish(self, expected: usize) -> RoboSatResult<EpochStats> {
        if self.samples < expected {
            return Err(RoboSatError::IncompletePass {
                phase: self.phase,
                expected,
                actual: self.samples,
            });
        }
        if self.samples == 0 {
            return Err(RoboSatError::EmptyDataset { phase: self.phase });
        }
        Ok(EpochStats {
            loss: self.running_loss(),
            miou: self.metrics.miou(),
            fg_iou: self.metrics.fg_iou(),
            mcc: self.metrics.mcc(),
            samples: self.samples,
        })
    }
}

/// Images and masks must agree on batch size and resolution, and every mask
/// id must name one of the `num_classes` classes.
fn check_batch<B: Backend>(
    images: &Tensor<B, 4>,
    masks: &Tensor<B, 3, Int>,
    num_classes: usize,
) -> RoboSatResult<()> {
    let [n, _, h, w] = images.dims();
    if masks.dims() != [n, h, w] {
        return Err(RoboSatError::shape("images and masks", [n, h, w], masks.dims()));
    }

    let min = masks.clone().min().into_scalar().elem::<i64>();
    let max = masks.clone().max().into_scalar().elem::<i64>();
    if min < 0 || max >= num_classes as i64 {
        return Err(RoboSatError::shape(
            "mask class ids",
            0..num_classes as i64,
            min..=max,
        ));
    }
    Ok(())
}

/// Outputs must match the masks' resolution and the configured class count.
fn check_outputs<B: Backend>(
    outputs: &Tensor<B, 4>,
    masks: &Tensor<B, 3, Int>,
    num_classes: usize,
) -> RoboSatResult<()> {
    let [n, h, w] = masks.dims();
    let expected = [n, num_classes, h, w];
    if outputs.dims() != expected {
        return Err(RoboSatError::shape("predictions", expected, outputs.dims()));
    }
    Ok(())
}

/// Drives a model, optimizer and loss through the epoch loop.
pub struct Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + SegmentationModel<B>,
    O: Optimizer<M, B>,
{
    model: M,
    optim: O,
    loss: Box<dyn TrainingLoss<B>>,
    options: TrainingOptions,
    start_epoch: usize,
    phase: Phase,
}

impl<B, M, O> Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + SegmentationModel<B>,
    M::InnerModule: SegmentationModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    pub fn new(model: M, optim: O, loss: Box<dyn TrainingLoss<B>>, options: TrainingOptions) -> Self {
        Self {
            model,
            optim,
            loss,
            options,
            start_epoch: 0,
            phase: Phase::Idle,
        }
    }

    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// The first epoch the next [`Trainer::fit`] runs, 0-based.
    pub const fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub const fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "Driver phase");
        self.phase = phase;
    }

    /// Reads a checkpoint written for this model and optimizer.
    ///
    /// # Errors
    ///
    /// See [`checkpoint::load`].
    pub fn load_checkpoint(
        &self,
        path: &Path,
        device: &B::Device,
    ) -> RoboSatResult<Checkpoint<M::Record, O::Record>> {
        checkpoint::load::<B, M::Record, O::Record>(path, device)
    }

    /// Restores model weights only; training starts at epoch 0.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the weights do not fit the model.
    pub fn warm_start(mut self, model: M::Record) -> RoboSatResult<Self> {
        self.enter(Phase::Initializing);
        self.model = checkpoint::restore_module(self.model, model)?;
        self.start_epoch = 0;
        Ok(self)
    }

    /// Restores weights, optimizer state and the epoch counter.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the checkpoint already reaches the configured
    /// epochs and `ShapeMismatch` if the weights do not fit the model.
    pub fn resume(mut self, checkpoint: Checkpoint<M::Record, O::Record>) -> RoboSatResult<Self> {
        self.enter(Phase::Initializing);
        let start = resume_epoch(checkpoint.epoch, self.options.epochs)?;
        self.model = checkpoint::restore_module(self.model, checkpoint.model)?;
        self.optim = self.optim.load_record(checkpoint.optimizer);
        self.start_epoch = start;
        tracing::info!(epoch = start, "Resuming training");
        Ok(self)
    }

    fn progress(&self, accumulator: &EpochAccumulator, last: bool) {
        let every = self.options.log_every.max(1);
        if last || accumulator.batches % every == 0 {
            tracing::info!(
                phase = accumulator.phase,
                batch = accumulator.batches,
                samples = accumulator.samples,
                loss = accumulator.running_loss(),
                "Progress"
            );
        }
    }

    /// One optimization pass over `loader`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` on inconsistent batches, out-of-range mask ids
    /// or mispredicted shapes, `IncompletePass` if the loader dropped samples
    /// and `EmptyDataset` if it yields nothing.
    pub fn train_epoch(
        &mut self,
        loader: &dyn DataLoader<B, TileBatch<B>>,
    ) -> RoboSatResult<EpochStats> {
        self.enter(Phase::TrainEpoch);
        let mut epoch = EpochAccumulator::new("train", self.options.num_classes);

        let mut batches = loader.iter().peekable();
        while let Some(batch) = batches.next() {
            check_batch(&batch.images, &batch.masks, self.options.num_classes)?;

            let outputs = self.model.forward(batch.images);
            check_outputs(&outputs, &batch.masks, self.options.num_classes)?;

            let loss =
                SegmentationLoss::<B>::forward(self.loss.as_ref(), outputs.clone(), batch.masks.clone());
            let loss_value = loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            self.model = self
                .optim
                .step(self.options.learning_rate, self.model.clone(), grads);

            epoch.add(loss_value, batch.masks, outputs.detach())?;
            self.progress(&epoch, batches.peek().is_none());
        }

        epoch.finish(loader.num_items())
    }

    /// One evaluation pass over `loader` without gradients or optimizer steps.
    ///
    /// # Errors
    ///
    /// Same as [`Trainer::train_epoch`].
    pub fn validate_epoch(
        &mut self,
        loader: &dyn DataLoader<B::InnerBackend, TileBatch<B::InnerBackend>>,
    ) -> RoboSatResult<EpochStats> {
        self.enter(Phase::ValidateEpoch);
        let model = self.model.valid();
        let mut epoch = EpochAccumulator::new("validate", self.options.num_classes);

        let mut batches = loader.iter().peekable();
        while let Some(batch) = batches.next() {
            check_batch(&batch.images, &batch.masks, self.options.num_classes)?;

            let outputs = model.forward(batch.images);
            check_outputs(&outputs, &batch.masks, self.options.num_classes)?;

            let loss = SegmentationLoss::<B::InnerBackend>::forward(
                self.loss.as_ref(),
                outputs.clone(),
                batch.masks.clone(),
            );
            let loss_value = loss.into_scalar().elem::<f64>();

            epoch.add(loss_value, batch.masks, outputs)?;
            self.progress(&epoch, batches.peek().is_none());
        }

        epoch.finish(loader.num_items())
    }

    /// Runs every remaining epoch, writing one checkpoint per epoch.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if no epoch is left to run, and any error a
    /// pass or checkpoint write reports.
    pub fn fit(
        &mut self,
        train: &dyn DataLoader<B, TileBatch<B>>,
        valid: &dyn DataLoader<B::InnerBackend, TileBatch<B::InnerBackend>>,
        sink: &mut dyn LogSink,
    ) -> RoboSatResult<Vec<EpochReport>> {
        self.enter(Phase::Initializing);
        let total = self.options.epochs;
        resume_epoch(self.start_epoch, total)?;

        let foreground = self.options.foreground_title.clone();
        let mut reports = Vec::with_capacity(total - self.start_epoch);

        for epoch in self.start_epoch..total {
            sink.log("---");
            sink.log(&format!("Epoch: {}/{}", epoch + 1, total));

            let train_stats = self.train_epoch(train)?;
            sink.log(&train_stats.summary("Train   ", &foreground));

            let validate_stats = self.validate_epoch(valid)?;
            sink.log(&validate_stats.summary("Validate", &foreground));

            self.enter(Phase::CheckpointEpoch);
            let path = checkpoint::checkpoint_path(&self.options.out, epoch + 1, total);
            checkpoint::save::<B, _, _>(
                &path,
                epoch + 1,
                self.model.clone().into_record(),
                self.optim.to_record(),
            )?;
            self.start_epoch = epoch + 1;

            reports.push(EpochReport {
                epoch: epoch + 1,
                train: train_stats,
                validate: validate_stats,
                checkpoint: path,
            });
        }

        self.enter(Phase::Done);
        Ok(reports)
    }
}

/// Everything `rsp-train` resolves before handing over to [`run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Configuration with command-line overrides already applied.
    pub config: RoboSatConfig,
    /// Directory for checkpoints and the log file.
    pub out: PathBuf,
    pub checkpoint: Option<PathBuf>,
    pub resume: bool,
    pub workers: usize,
    /// Backend name for the banner.
    pub backend: String,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Writes the input layout and hyper parameters to the log.
pub fn log_banner(sink: &mut dyn LogSink, config: &RoboSatConfig, backend: &str, workers: usize) {
    let model = &config.model;

    sink.log(&format!(
        "RoboSat - training on {backend}, with {workers} workers"
    ));
    sink.log("");
    sink.log(&format!(
        "--- Input tensor from Dataset: {} ---",
        config.dataset.path.display()
    ));
    let bands = config
        .channels
        .iter()
        .flat_map(|channel| channel.bands.iter().map(move |band| (&channel.sub, band)));
    for (index, (sub, band)) in bands.enumerate() {
        sink.log(&format!("Channel {}:\t\t {sub}[band: {band}]", index + 1));
    }
    sink.log("");
    sink.log("--- Hyper Parameters ---");
    sink.log(&format!("Model:\t\t\t {}", model.name));
    sink.log(&format!("Encoder model:\t\t {}", model.encoder));
    sink.log(&format!("Loss function:\t\t {}", model.loss));
    sink.log(&format!("ResNet pre-trained:\t {}", model.pretrained));
    sink.log(&format!("Batch Size:\t\t {}", model.batch_size));
    sink.log(&format!("Tile Size:\t\t {}", model.tile_size));
    sink.log(&format!("Data Augmentation:\t {}", model.data_augmentation));
    sink.log(&format!("Learning Rate:\t\t {}", model.lr));
    sink.log(&format!("Weight Decay:\t\t {}", model.decay));
    sink.log("");
}

fn build_loaders<B: AutodiffBackend>(
    config: &RoboSatConfig,
    workers: usize,
    device: &B::Device,
) -> RoboSatResult<(
    Arc<dyn DataLoader<B, TileBatch<B>>>,
    Arc<dyn DataLoader<B::InnerBackend, TileBatch<B::InnerBackend>>>,
)> {
    let root = &config.dataset.path;
    let tile_size = config.model.tile_size;
    let augmentation = config.model.data_augmentation;

    let train_dataset = TileDataset::new(
        root,
        "training",
        &config.channels,
        pipeline(tile_size, augmentation),
        SEED,
    )?;
    let valid_dataset = TileDataset::new(
        root,
        "validation",
        &config.channels,
        pipeline(tile_size, augmentation),
        SEED,
    )?;

    let mut train = DataLoaderBuilder::new(TileBatcher::<B>::new())
        .batch_size(config.model.batch_size)
        .shuffle(SEED)
        .set_device(device.clone());
    let mut valid = DataLoaderBuilder::new(TileBatcher::<B::InnerBackend>::new())
        .batch_size(config.model.batch_size)
        .set_device(device.clone());
    if workers > 0 {
        train = train.num_workers(workers);
        valid = valid.num_workers(workers);
    }

    Ok((train.build(train_dataset), valid.build(valid_dataset)))
}

/// Builds every component from the configuration and trains to completion.
///
/// # Errors
///
/// Returns `Configuration` for invalid settings, unknown plugins or a resume
/// target already met, plus any dataset, checkpoint or pass error.
pub fn run<B: AutodiffBackend>(
    device: B::Device,
    options: RunOptions,
) -> RoboSatResult<Vec<EpochReport>> {
    let RunOptions {
        config,
        out,
        checkpoint,
        resume,
        workers,
        backend,
    } = options;
    config.validate()?;
    if resume && checkpoint.is_none() {
        return Err(RoboSatError::configuration(
            "resuming needs a checkpoint to resume from",
        ));
    }

    tracing::info!(?device, backend = %backend, "Initializing training");
    B::seed(SEED);

    let plugins = Plugins::<B>::builtin();
    let net_config = NetConfig::new(config.num_classes(), config.num_channels())
        .with_encoder(config.model.encoder.clone())
        .with_pretrained(config.model.pretrained);
    let model = plugins.build_model(&config.model.name, &net_config, &device)?;
    let loss = plugins.build_loss(&config.model.loss)?;

    let multiple = model.input_multiple();
    if config.model.tile_size as usize % multiple != 0 {
        return Err(RoboSatError::configuration(format!(
            "tile_size {} must be a multiple of {multiple} for {}",
            config.model.tile_size, config.model.name
        )));
    }

    let mut logs = Logs::new(&out)?;
    log_banner(&mut logs, &config, &backend, workers);

    let weight_decay =
        (config.model.decay > 0.0).then(|| WeightDecayConfig::new(config.model.decay as f32));
    let optim = AdamConfig::new()
        .with_weight_decay(weight_decay)
        .init::<B, Net<B>>();

    let training = TrainingOptions::new(
        config.num_classes(),
        config.model.epochs,
        config.model.lr,
        out.clone(),
    )
    .with_foreground_title(config.foreground_title().to_string());
    let mut trainer = Trainer::new(model, optim, loss, training);

    if let Some(path) = &checkpoint {
        let restored = trainer.load_checkpoint(path, &device)?;
        logs.log(&format!("Using checkpoint: {}", path.display()));
        trainer = if resume {
            trainer.resume(restored)?
        } else {
            trainer.warm_start(restored.model)?
        };
    }
    resume_epoch(trainer.start_epoch(), config.model.epochs)?;

    let (train_loader, valid_loader) = build_loaders::<B>(&config, workers, &device)?;
    let reports = trainer.fit(&*train_loader, &*valid_loader, &mut logs)?;

    tracing::info!(epochs = reports.len(), out = %out.display(), "Training completed");
    Ok(reports)
}
