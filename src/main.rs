use std::path::PathBuf;

use anyhow::{anyhow, Result};
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    config::Config,
};
use clap::{Parser, ValueEnum};

use face_mask_detector::{
    logging::{init_logging, LogConfig},
    pipeline::{run, RunOptions, DEFAULT_MODEL_PATH, DEFAULT_PLOT_PATH},
    training::TrainingConfig,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Wgpu,
    Ndarray,
}

/// Fine-tune a MobileNetV2 head to tell masked from unmasked faces
#[derive(Parser, Debug)]
#[command(name = "face-mask-detector", version, about, long_about = None)]
struct Cli {
    /// Input dataset: one subdirectory of images per class
    #[arg(short, long)]
    dataset: PathBuf,

    /// Output loss/accuracy plot
    #[arg(short, long, default_value = DEFAULT_PLOT_PATH)]
    plot: PathBuf,

    /// Output face mask detector model
    #[arg(short, long, default_value = DEFAULT_MODEL_PATH)]
    model: PathBuf,

    /// TrainingConfig JSON file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pretrained backbone record
    #[arg(short, long)]
    backbone: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu)]
    backend: BackendKind,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(&log_config)?;

    let config = match &cli.config {
        Some(path) => TrainingConfig::load(path)
            .map_err(|e| anyhow!("failed to read config {}: {e:?}", path.display()))?,
        None => TrainingConfig::new(),
    };

    let options = RunOptions {
        dataset: cli.dataset,
        plot: cli.plot,
        model: cli.model,
        backbone: cli.backbone,
    };

    let summary = match cli.backend {
        BackendKind::Wgpu => {
            run::<Autodiff<Wgpu<f32, i32>>>(&options, &config, &WgpuDevice::default())?
        }
        BackendKind::Ndarray => run::<Autodiff<NdArray>>(&options, &config, &Default::default())?,
    };

    tracing::info!(
        "done: model {}, metadata {}, plot {}",
        summary.model_path.display(),
        summary.metadata_path.display(),
        summary.plot_path.display()
    );
    Ok(())
}
