//! End-to-end driver tests over an in-memory dataset.

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    data::{
        dataloader::DataLoaderBuilder,
        dataset::{Dataset, InMemDataset},
    },
    module::Param,
    optim::AdamConfig,
    prelude::*,
};

use image::{GrayImage, Luma, Rgb, RgbImage};

use crate::{
    config::{ChannelConfig, ClassesSection, DatasetSection, ModelSection},
    dataset::{TileBatcher, TileDataset, TileItem},
    losses::CrossEntropyLossConfig,
    models::SegmentationModel,
    tiles::Tile,
    transforms::JointCompose,
    training::{run, Phase, RunOptions, Trainer, TrainingOptions},
    RoboSatConfig, RoboSatError,
};

pub(crate) type TestBackend = burn::backend::NdArray<f32>;
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;

/// Scores class 1 by the sign of input channel 0, scaled by one learnable weight.
#[derive(Module, Debug)]
pub(crate) struct Oracle<B: Backend> {
    pub scale: Param<Tensor<B, 1>>,
}

impl<B: Backend> Oracle<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            scale: Param::from_tensor(Tensor::ones([1], device)),
        }
    }
}

impl<B: Backend> SegmentationModel<B> for Oracle<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.scale.val().reshape([1, 1, 1, 1]);
        let foreground = images.narrow(1, 0, 1) * scale;
        Tensor::cat(vec![foreground.clone().neg(), foreground], 1)
    }
}

/// Three 4x4 single-channel samples whose pixels are +1 on class 1 and -1 elsewhere.
pub(crate) fn oracle_items() -> Vec<TileItem> {
    (0..3)
        .map(|i| {
            let mask: Vec<i64> = (0..16).map(|p| i64::from((p + i) % 3 == 0)).collect();
            let image = mask.iter().map(|&id| if id == 1 { 1.0 } else { -1.0 }).collect();
            TileItem {
                image,
                mask,
                channels: 1,
                height: 4,
                width: 4,
                tile: Tile::new(18, 0, i as u32),
            }
        })
        .collect()
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("robosat-driver-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

fn oracle_trainer(
    epochs: usize,
    out: &PathBuf,
) -> Trainer<
    TestAutodiffBackend,
    Oracle<TestAutodiffBackend>,
    impl burn::optim::Optimizer<Oracle<TestAutodiffBackend>, TestAutodiffBackend>,
> {
    let device = Default::default();
    Trainer::new(
        Oracle::new(&device),
        AdamConfig::new().init::<TestAutodiffBackend, Oracle<TestAutodiffBackend>>(),
        Box::new(CrossEntropyLossConfig::new().init()),
        TrainingOptions::new(2, epochs, 1e-2, out.clone())
            .with_foreground_title("building".to_string()),
    )
}

fn assert_near(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
}

#[test]
fn fit_trains_validates_and_checkpoints_every_epoch() {
    let out = scratch_dir("fit");
    let mut trainer = oracle_trainer(2, &out);

    let train = DataLoaderBuilder::new(TileBatcher::<TestAutodiffBackend>::new())
        .batch_size(2)
        .build(InMemDataset::new(oracle_items()));
    let valid = DataLoaderBuilder::new(TileBatcher::<TestBackend>::new())
        .batch_size(2)
        .build(InMemDataset::new(oracle_items()));

    let mut lines = Vec::new();
    let reports = trainer.fit(&*train, &*valid, &mut lines).expect("fit");

    assert_eq!(trainer.phase(), Phase::Done);
    assert_eq!(reports.len(), 2);
    for (index, report) in reports.iter().enumerate() {
        assert_eq!(report.epoch, index + 1);
        assert!(report.checkpoint.is_file());
        for stats in [report.train, report.validate] {
            assert_eq!(stats.samples, 3);
            assert_near(stats.miou, 1.0);
            assert_near(stats.fg_iou, 1.0);
            assert_near(stats.mcc, 1.0);
        }
    }
    assert!(reports[1].train.loss < reports[0].train.loss);
    assert!(out.join("checkpoint-00002-of-00002.bin").is_file());

    assert_eq!(lines[0], "---");
    assert_eq!(lines[1], "Epoch: 1/2");
    assert!(lines[2].starts_with("Train    loss: "));
    assert!(lines[2].ends_with("mIoU: 1.000, building IoU: 1.000, MCC: 1.000"));
    assert!(lines[3].starts_with("Validate loss: "));
    assert_eq!(lines[5], "Epoch: 2/2");

    fs::remove_dir_all(out).ok();
}

#[test]
fn resume_continues_after_the_checkpointed_epoch() {
    let out = scratch_dir("resume");
    let device = Default::default();
    let train = DataLoaderBuilder::new(TileBatcher::<TestAutodiffBackend>::new())
        .batch_size(3)
        .build(InMemDataset::new(oracle_items()));
    let valid = DataLoaderBuilder::new(TileBatcher::<TestBackend>::new())
        .batch_size(3)
        .build(InMemDataset::new(oracle_items()));

    let mut first = oracle_trainer(3, &out);
    let first_reports = first
        .fit(&*train, &*valid, &mut Vec::new())
        .expect("first run");
    let trained_scale: f32 = first.model().scale.val().into_scalar();

    // Resume from the second of three checkpoints.
    let fresh = oracle_trainer(3, &out);
    let checkpoint = fresh
        .load_checkpoint(&first_reports[1].checkpoint, &device)
        .expect("load");
    assert_eq!(checkpoint.epoch, 2);
    let mut resumed = fresh.resume(checkpoint).expect("resumable");
    assert_eq!(resumed.start_epoch(), 2);

    let mut lines = Vec::new();
    let reports = resumed.fit(&*train, &*valid, &mut lines).expect("resumed run");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].epoch, 3);
    assert_eq!(lines[1], "Epoch: 3/3");

    // The same single step from the same model and optimizer state.
    let resumed_scale: f32 = resumed.model().scale.val().into_scalar();
    assert!((resumed_scale - trained_scale).abs() < 1e-5);

    fs::remove_dir_all(out).ok();
}

#[test]
fn finished_checkpoint_cannot_be_resumed() {
    let out = scratch_dir("finished");
    let device = Default::default();
    let train = DataLoaderBuilder::new(TileBatcher::<TestAutodiffBackend>::new())
        .batch_size(3)
        .build(InMemDataset::new(oracle_items()));
    let valid = DataLoaderBuilder::new(TileBatcher::<TestBackend>::new())
        .batch_size(3)
        .build(InMemDataset::new(oracle_items()));

    let mut trainer = oracle_trainer(1, &out);
    let reports = trainer
        .fit(&*train, &*valid, &mut Vec::new())
        .expect("one epoch");

    let fresh = oracle_trainer(1, &out);
    let checkpoint = fresh
        .load_checkpoint(&reports[0].checkpoint, &device)
        .expect("load");
    match fresh.resume(checkpoint) {
        Err(err) => assert!(err.is_configuration_error()),
        Ok(_) => panic!("A checkpoint at the final epoch must not resume"),
    }

    fs::remove_dir_all(out).ok();
}

#[test]
fn warm_start_restarts_at_epoch_zero() {
    let out = scratch_dir("warm");
    let device = Default::default();
    let train = DataLoaderBuilder::new(TileBatcher::<TestAutodiffBackend>::new())
        .batch_size(3)
        .build(InMemDataset::new(oracle_items()));
    let valid = DataLoaderBuilder::new(TileBatcher::<TestBackend>::new())
        .batch_size(3)
        .build(InMemDataset::new(oracle_items()));

    let mut trainer = oracle_trainer(1, &out);
    let reports = trainer
        .fit(&*train, &*valid, &mut Vec::new())
        .expect("one epoch");
    let trained_scale: f32 = trainer.model().scale.val().into_scalar();

    let fresh = oracle_trainer(1, &out);
    let checkpoint = fresh
        .load_checkpoint(&reports[0].checkpoint, &device)
        .expect("load");
    let warm = fresh.warm_start(checkpoint.model).expect("same shapes");

    assert_eq!(warm.start_epoch(), 0);
    assert_eq!(warm.phase(), Phase::Initializing);
    let warm_scale: f32 = warm.model().scale.val().into_scalar();
    assert_eq!(warm_scale, trained_scale);

    fs::remove_dir_all(out).ok();
}

/// An RGB tile with a vertical edge and its label: class 1 right of the edge.
fn write_sample(split_dir: &Path, tile: Tile, size: u32) {
    let stem = format!("{}/{}/{}.png", tile.z, tile.x, tile.y);
    let image = split_dir.join("images").join(&stem);
    let label = split_dir.join("labels").join(&stem);
    for path in [&image, &label] {
        fs::create_dir_all(path.parent().expect("parent")).expect("create tile dirs");
    }

    RgbImage::from_fn(size, size, |x, y| {
        if x >= size / 2 {
            Rgb([220, 200, u8::try_from(y).unwrap_or(u8::MAX)])
        } else {
            Rgb([20, 40, 60])
        }
    })
    .save(image)
    .expect("write image tile");
    GrayImage::from_fn(size, size, |x, _| Luma([u8::from(x >= size / 2)]))
        .save(label)
        .expect("write label tile");
}

#[test]
fn undecodable_tile_fails_the_pass_instead_of_shortening_it() {
    let root = scratch_dir("corrupt-tile");
    let split = root.join("training");
    for y in 0..3 {
        write_sample(&split, Tile::new(18, 5, y), 4);
    }
    fs::write(split.join("images/18/5/1.png"), b"not a png").expect("corrupt tile");

    let channels = vec![ChannelConfig::new("images".to_string(), vec![1])];
    let dataset =
        TileDataset::new(&root, "training", &channels, JointCompose::new(), 0).expect("index");
    assert_eq!(dataset.len(), 3);

    let loader = DataLoaderBuilder::new(TileBatcher::<TestAutodiffBackend>::new())
        .batch_size(1)
        .build(dataset);
    let mut trainer = oracle_trainer(1, &root);
    match trainer.train_epoch(&*loader) {
        Err(RoboSatError::IncompletePass {
            phase,
            expected,
            actual,
        }) => {
            assert_eq!(phase, "train");
            assert_eq!(expected, 3);
            assert_eq!(actual, 1);
        }
        other => panic!("Expected IncompletePass, got {other:?}"),
    }

    fs::remove_dir_all(root).ok();
}

fn run_options(model: &str, out: PathBuf) -> RunOptions {
    RunOptions {
        config: RoboSatConfig::new(
            ModelSection {
                epochs: 1,
                ..ModelSection::new(model.to_string(), "lovasz".to_string())
            },
            DatasetSection::new(out.join("dataset")),
            ClassesSection::new(vec!["background".to_string(), "building".to_string()]),
            vec![ChannelConfig::new("images".to_string(), vec![1, 2, 3])],
        ),
        out,
        checkpoint: None,
        resume: false,
        workers: 0,
        backend: "ndarray".to_string(),
    }
}

#[test]
fn run_rejects_unknown_model_before_reading_tiles() {
    let out = scratch_dir("unknown-model");

    let result = run::<TestAutodiffBackend>(Default::default(), run_options("segnet", out.clone()));
    match result {
        Err(RoboSatError::UnknownPlugin { kind, available, .. }) => {
            assert_eq!(kind, "model");
            assert_eq!(available, vec!["albunet", "unet"]);
        }
        other => panic!("Expected UnknownPlugin, got {other:?}"),
    }

    assert!(!out.join("log").exists(), "no banner for a run that never starts");

    fs::remove_dir_all(out).ok();
}

#[test]
fn run_requires_a_checkpoint_to_resume() {
    let out = scratch_dir("resume-flag");
    let mut options = run_options("albunet", out.clone());
    options.resume = true;

    let err = run::<TestAutodiffBackend>(Default::default(), options).expect_err("no checkpoint");
    assert!(err.is_configuration_error());

    fs::remove_dir_all(out).ok();
}

#[test]
fn run_trains_unet_from_tiles_on_disk_and_refuses_to_resume_a_finished_run() {
    let scratch = scratch_dir("end-to-end");
    let dataset = scratch.join("dataset");
    let out = scratch.join("out");
    for y in 0..2 {
        write_sample(&dataset.join("training"), Tile::new(18, 3, y), 16);
    }
    write_sample(&dataset.join("validation"), Tile::new(18, 4, 0), 16);

    let mut options = run_options("unet", out.clone());
    options.config.dataset.path = dataset;
    options.config.model.loss = "cross_entropy".to_string();
    options.config.model.tile_size = 16;
    options.config.model.batch_size = 2;
    options.config.model.decay = 0.0001;

    let reports = run::<TestAutodiffBackend>(Default::default(), options.clone()).expect("run");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].train.samples, 2);
    assert_eq!(reports[0].validate.samples, 1);
    assert!(reports[0].train.loss.is_finite());

    let checkpoint = out.join("checkpoint-00001-of-00001.bin");
    assert!(checkpoint.is_file());
    let log = fs::read_to_string(out.join("log")).expect("log written");
    assert!(log.contains("Loss function:\t\t cross_entropy"));
    assert!(log.contains("Epoch: 1/1"));

    options.checkpoint = Some(checkpoint);
    options.resume = true;
    let err = run::<TestAutodiffBackend>(Default::default(), options).expect_err("finished run");
    assert!(err.is_configuration_error());

    fs::remove_dir_all(scratch).ok();
}
