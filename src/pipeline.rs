//! One training run: load, encode, split, train, evaluate, save, plot.

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{data::dataset::Dataset, prelude::*, tensor::backend::AutodiffBackend};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    data::{list_images, ImageDataset},
    error::{Error, Result},
    label::{argmax, LabelEncoder},
    model::{load_model, save_model, Model},
    plot::plot_history,
    report::ClassificationReport,
    split::{stratified_split, DatasetSplit},
    training::{predict, train, TrainingConfig, TrainingHistory},
};

pub const DEFAULT_PLOT_PATH: &str = "plots/plot.png";
pub const DEFAULT_MODEL_PATH: &str = "face_mask_detector.model";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dataset: PathBuf,
    pub plot: PathBuf,
    pub model: PathBuf,
    /// Pretrained backbone weights; random initialisation when absent.
    pub backbone: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(dataset: impl Into<PathBuf>) -> Self {
        Self {
            dataset: dataset.into(),
            plot: PathBuf::from(DEFAULT_PLOT_PATH),
            model: PathBuf::from(DEFAULT_MODEL_PATH),
            backbone: None,
        }
    }
}

/// Stored beside the model so it can be rebuilt and its labels decoded.
#[derive(Serialize, Deserialize)]
pub struct RunMetadata {
    pub classes: Vec<String>,
    pub config: TrainingConfig,
    pub history: TrainingHistory,
}

pub struct RunSummary {
    pub classes: Vec<String>,
    pub history: TrainingHistory,
    pub report: ClassificationReport,
    pub model_path: PathBuf,
    pub metadata_path: PathBuf,
    pub plot_path: PathBuf,
}

/// `face_mask_detector.model` -> `face_mask_detector.model.json`
pub fn metadata_path(model_path: &Path) -> PathBuf {
    let mut path = model_path.as_os_str().to_owned();
    path.push(".json");
    PathBuf::from(path)
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn memory_budget_bytes(config: &TrainingConfig) -> usize {
    config.memory_budget_mb.saturating_mul(1 << 20)
}

fn class_indices(rows: &Array2<f32>) -> Result<Vec<usize>> {
    rows.rows()
        .into_iter()
        .map(|row| argmax(row).ok_or_else(|| Error::Tensor("empty probability row".to_owned())))
        .collect()
}

pub fn run<B: AutodiffBackend>(
    options: &RunOptions,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<RunSummary> {
    tracing::info!("Loading images from {}", options.dataset.display());
    let records = list_images(&options.dataset)?;
    let dataset = ImageDataset::load(records, memory_budget_bytes(config))?;

    let labels = dataset.labels();
    let encoder = LabelEncoder::fit(&labels)?;
    let targets = encoder.transform(&labels)?;
    let indices = stratified_split(&encoder.indices(&labels)?, &config.split)?;
    let split = DatasetSplit::new(&dataset, &targets, &indices);
    tracing::info!(
        "{} images in {} classes {:?}: {} train / {} test",
        dataset.len(),
        encoder.len(),
        encoder.classes(),
        indices.train.len(),
        indices.test.len()
    );

    tracing::info!("Compiling model");
    let backbone = config.model.init_backbone::<B::InnerBackend>(device);
    let backbone = match &options.backbone {
        Some(path) => {
            tracing::info!("loading backbone weights from {}", path.display());
            backbone.load_pretrained(path, device)?
        }
        None => {
            tracing::warn!("no pretrained backbone given; features come from random weights");
            backbone
        }
    };

    tracing::info!("Training head");
    let trained = train::<B>(config, backbone, encoder.len(), &split, device)?;

    tracing::info!("Evaluating network");
    let probs = predict(&trained.model, &split.test_images, config.batch_size, device)?;
    let y_pred = class_indices(&probs)?;
    let y_true = class_indices(&split.test_targets)?;
    for (row, truth) in probs.rows().into_iter().zip(split.test_images.labels()) {
        if let Some(predicted) = encoder.decode_row(row).filter(|&p| p != truth) {
            tracing::debug!("{truth} sample classified as {predicted}");
        }
    }
    let report = ClassificationReport::new(&y_true, &y_pred, encoder.classes());
    println!("{report}");

    tracing::info!("Saving model to {}", options.model.display());
    create_parent(&options.model)?;
    save_model(trained.model, &options.model)?;

    let metadata = RunMetadata {
        classes: encoder.classes().to_vec(),
        config: config.clone(),
        history: trained.history,
    };
    let metadata_path = metadata_path(&options.model);
    fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

    plot_history(&metadata.history, &options.plot)?;
    tracing::info!("training curves written to {}", options.plot.display());

    Ok(RunSummary {
        classes: metadata.classes,
        history: metadata.history,
        report,
        model_path: options.model.clone(),
        metadata_path,
        plot_path: options.plot.clone(),
    })
}

pub fn load_metadata(model_path: &Path) -> Result<RunMetadata> {
    let text = fs::read_to_string(metadata_path(model_path))?;
    Ok(serde_json::from_str(&text)?)
}

/// Rebuilds a model saved by [`run`] together with its metadata.
pub fn load_trained<B: Backend>(model_path: &Path, device: &B::Device) -> Result<(Model<B>, RunMetadata)> {
    let metadata = load_metadata(model_path)?;
    let model = load_model(&metadata.config.model, metadata.classes.len(), model_path, device)?;
    Ok((model, metadata))
}
