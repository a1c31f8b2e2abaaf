use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use robosat_burn::{run, RoboSatConfig, RunOptions};
use robosat_cli::backend::{backend_name, create_device, TrainingBackend};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rsp-train")]
#[command(about = "Trains a semantic segmentation model on slippy-map tiles")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long)]
    config: PathBuf,

    /// Checkpoint to warm start from, or to resume with `--resume`
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Restore optimizer state and epoch counter from the checkpoint
    #[arg(long, requires = "checkpoint")]
    resume: bool,

    /// Data loader worker threads
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Override the dataset root from the configuration
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Override the number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Directory for checkpoints and the log file
    out: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    ensure!(
        !cli.out.is_file(),
        "output directory {} is an existing file",
        cli.out.display()
    );

    let mut config = RoboSatConfig::load(&cli.config)
        .with_context(|| format!("loading configuration {}", cli.config.display()))?;
    if let Some(dataset) = cli.dataset {
        config.dataset.path = dataset;
    }
    if let Some(epochs) = cli.epochs {
        config.model.epochs = epochs;
    }
    if let Some(lr) = cli.lr {
        config.model.lr = lr;
    }

    let device = create_device();
    let options = RunOptions {
        config,
        out: cli.out,
        checkpoint: cli.checkpoint,
        resume: cli.resume,
        workers: cli.workers,
        backend: backend_name().to_string(),
    };

    let reports = run::<TrainingBackend>(device, options).context("training failed")?;
    if let Some(last) = reports.last() {
        tracing::info!(
            epoch = last.epoch,
            checkpoint = %last.checkpoint.display(),
            "Latest checkpoint"
        );
    }
    Ok(())
}
