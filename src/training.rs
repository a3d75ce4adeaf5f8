use burn::{
    config::Config,
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use ndarray::{concatenate, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::{
    augment::{AugmentationConfig, Augmenter},
    data::{FaceMaskBatcher, ImageDataset},
    error::{Error, Result},
    label::argmax,
    model::{Backbone, Head, Model, ModelConfig},
    schedule::{LrDecay, LrSchedule},
    split::{DatasetSplit, SplitConfig},
};

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` before taking logs.
const EPSILON: f64 = 1e-7;

#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,

    #[config(default = "AdamConfig::new().with_epsilon(1e-7)")]
    pub optimizer: AdamConfig,

    #[config(default = "AugmentationConfig::new()")]
    pub augmentation: AugmentationConfig,

    #[config(default = "SplitConfig::new()")]
    pub split: SplitConfig,

    #[config(default = 20)]
    pub epoch_count: usize,

    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,

    #[config(default = "LrDecay::Linear")]
    pub lr_decay: LrDecay,

    #[config(default = 42)]
    pub seed: u64,

    /// Above this many decoded MiB the dataset is read lazily.
    #[config(default = 4096)]
    pub memory_budget_mb: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    fn series(&self, metric: impl Fn(&EpochMetrics) -> f64) -> Vec<f64> {
        self.epochs.iter().map(metric).collect()
    }

    pub fn loss(&self) -> Vec<f64> {
        self.series(|m| m.loss)
    }

    pub fn val_loss(&self) -> Vec<f64> {
        self.series(|m| m.val_loss)
    }

    pub fn accuracy(&self) -> Vec<f64> {
        self.series(|m| m.accuracy)
    }

    pub fn val_accuracy(&self) -> Vec<f64> {
        self.series(|m| m.val_accuracy)
    }
}

pub struct TrainedModel<B: Backend> {
    pub model: Model<B>,
    pub history: TrainingHistory,
}

/// Full batches available from `samples`; the remainder is dropped.
pub fn steps_per_epoch(samples: usize, batch_size: usize) -> Result<usize> {
    if batch_size == 0 {
        return Err(Error::Config("batch size must be positive".to_owned()));
    }
    Ok(samples / batch_size)
}

/// Mean binary cross-entropy of `probs` against one-hot `targets`.
pub fn binary_cross_entropy<B: Backend>(probs: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    let probs = probs.clamp(EPSILON, 1.0 - EPSILON);
    let positive = targets.clone() * probs.clone().log();
    let negative = targets.neg().add_scalar(1.0) * probs.neg().add_scalar(1.0).log();

    (positive + negative).neg().mean()
}

pub fn to_array2<B: Backend>(tensor: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [rows, cols] = tensor.dims();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Tensor(format!("{e:?}")))?;

    Array2::from_shape_vec((rows, cols), values).map_err(|e| Error::Tensor(e.to_string()))
}

/// Rows of `probs` whose argmax agrees with the argmax of `targets`.
pub fn correct_count(probs: &Array2<f32>, targets: &Array2<f32>) -> usize {
    probs
        .rows()
        .into_iter()
        .zip(targets.rows())
        .filter(|(p, t)| argmax(p.view()) == argmax(t.view()))
        .count()
}

/// Fits a fresh head on top of the frozen `backbone`.
///
/// The backbone lives on the inner backend, so it takes no part in the
/// autodiff graph and its batch norms use their stored statistics.
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    backbone: Backbone<B::InnerBackend>,
    classes: usize,
    split: &DatasetSplit,
    device: &B::Device,
) -> Result<TrainedModel<B::InnerBackend>> {
    B::seed(config.seed);

    let batch_size = config.batch_size;
    let steps = steps_per_epoch(split.train_images.len(), batch_size)?;
    let validation_steps = steps_per_epoch(split.test_images.len(), batch_size)?;
    if steps == 0 || validation_steps == 0 {
        return Err(Error::Config(format!(
            "batch size {batch_size} leaves no full batch in {} train / {} test samples",
            split.train_images.len(),
            split.test_images.len()
        )));
    }

    tracing::info!(
        "training for {} epochs: {steps} steps/epoch, {validation_steps} validation steps",
        config.epoch_count
    );

    let mut head: Head<B> = config.model.init_head(classes, device);
    let mut optim = config.optimizer.init();
    let mut schedule = LrSchedule::new(
        config.learning_rate,
        config.lr_decay,
        config.epoch_count,
        steps,
    );

    let augmenter = Augmenter::new(config.augmentation.clone());
    let mut stream = augmenter.flow(
        &split.train_images,
        &split.train_targets,
        batch_size,
        config.seed,
    );
    let batcher = FaceMaskBatcher::<B::InnerBackend>::new(device.clone());
    let mut history = TrainingHistory::default();

    for epoch in 1..=config.epoch_count {
        let mut loss_sum = 0.0;
        let mut correct = 0;
        let mut learning_rate = schedule.current();

        for _ in 0..steps {
            let items = stream
                .next()
                .ok_or_else(|| Error::Training("training stream is empty".to_owned()))??;
            let batch = batcher.batch(items);

            let features = Tensor::<B, 4>::from_inner(backbone.forward(batch.images));
            let targets = Tensor::<B, 2>::from_inner(batch.targets);
            let probs = head.forward(features);
            let loss = binary_cross_entropy(probs.clone(), targets.clone());

            loss_sum += loss.clone().into_scalar().elem::<f64>();
            correct += correct_count(&to_array2(probs.inner())?, &to_array2(targets.inner())?);

            let grads = GradientsParams::from_grads(loss.backward(), &head);
            learning_rate = schedule.advance();
            head = optim.step(learning_rate, head, grads);
        }

        let (val_loss, val_accuracy) = validate(
            &backbone,
            &head.valid(),
            split,
            validation_steps,
            batch_size,
            &batcher,
        )?;

        let metrics = EpochMetrics {
            epoch,
            loss: loss_sum / steps as f64,
            accuracy: correct as f64 / (steps * batch_size) as f64,
            val_loss,
            val_accuracy,
            learning_rate,
        };
        tracing::info!(
            "epoch {}/{}: loss {:.4} - accuracy {:.4} - val_loss {:.4} - val_accuracy {:.4} - lr {:.2e}",
            epoch,
            config.epoch_count,
            metrics.loss,
            metrics.accuracy,
            metrics.val_loss,
            metrics.val_accuracy,
            metrics.learning_rate
        );
        history.epochs.push(metrics);
    }

    Ok(TrainedModel {
        model: Model::new(backbone, head.valid()),
        history,
    })
}

/// Loss and accuracy over the first `steps` full batches of the test split.
fn validate<B: Backend>(
    backbone: &Backbone<B>,
    head: &Head<B>,
    split: &DatasetSplit,
    steps: usize,
    batch_size: usize,
    batcher: &FaceMaskBatcher<B>,
) -> Result<(f64, f64)> {
    let mut loss_sum = 0.0;
    let mut correct = 0;

    for step in 0..steps {
        let items = (step * batch_size..(step + 1) * batch_size)
            .map(|i| split.test_images.item(i, &split.test_targets))
            .collect::<Result<Vec<_>>>()?;

        let batch = batcher.batch(items);
        let probs = head.forward(backbone.forward(batch.images));
        let loss = binary_cross_entropy(probs.clone(), batch.targets.clone());

        loss_sum += loss.into_scalar().elem::<f64>();
        correct += correct_count(&to_array2(probs)?, &to_array2(batch.targets)?);
    }

    Ok((
        loss_sum / steps as f64,
        correct as f64 / (steps * batch_size) as f64,
    ))
}

/// Class probabilities for every image, in batches of `batch_size`.
pub fn predict<B: Backend>(
    model: &Model<B>,
    images: &ImageDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<Array2<f32>> {
    let batcher = FaceMaskBatcher::<B>::new(device.clone());
    let mut blocks = vec![];

    for start in (0..images.len()).step_by(batch_size.max(1)) {
        let end = (start + batch_size).min(images.len());
        let samples = (start..end)
            .map(|i| images.try_get(i))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = samples.iter().map(|sample| &sample.image).collect();

        blocks.push(to_array2(model.forward(batcher.images(&views)))?);
    }

    if blocks.is_empty() {
        return Ok(Array2::zeros((0, 0)));
    }
    let views: Vec<_> = blocks.iter().map(Array2::view).collect();
    concatenate(Axis(0), &views).map_err(|e| Error::Tensor(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{ImageRecord, ImageSample},
        split::SplitIndices,
    };
    use burn::backend::{Autodiff, NdArray};
    use image::{Rgb, RgbImage};
    use ndarray::{arr2, Array3};
    use std::fs;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn partial_batches_are_dropped() {
        assert_eq!(steps_per_epoch(100, 32).unwrap(), 3);
        assert_eq!(steps_per_epoch(31, 32).unwrap(), 0);
        assert_eq!(steps_per_epoch(64, 32).unwrap(), 2);
        assert!(steps_per_epoch(10, 0).is_err());
    }

    #[test]
    fn cross_entropy_matches_closed_form() {
        let device = Default::default();
        let probs = Tensor::<NdArray, 2>::from_floats([[0.8, 0.2], [0.1, 0.9]], &device);
        let targets = Tensor::<NdArray, 2>::from_floats([[1.0, 0.0], [0.0, 1.0]], &device);

        let loss: f32 = binary_cross_entropy(probs, targets).into_scalar();
        let expected = -(0.8f32.ln() + 0.9f32.ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn cross_entropy_stays_finite_on_saturated_outputs() {
        let device = Default::default();
        let probs = Tensor::<NdArray, 2>::from_floats([[1.0, 0.0]], &device);
        let targets = Tensor::<NdArray, 2>::from_floats([[0.0, 1.0]], &device);

        let loss: f32 = binary_cross_entropy(probs, targets).into_scalar();
        assert!(loss.is_finite());
    }

    #[test]
    fn accuracy_compares_argmax() {
        let probs = arr2(&[[0.9, 0.1], [0.3, 0.7], [0.6, 0.4]]);
        let targets = arr2(&[[1.0, 0.0], [1.0, 0.0], [1.0, 0.0]]);
        assert_eq!(correct_count(&probs, &targets), 2);
    }

    fn toy_split(train: usize, test: usize) -> DatasetSplit {
        let total = train + test;
        let samples = (0..total)
            .map(|i| ImageSample {
                image: Array3::from_elem((224, 224, 3), if i % 2 == 0 { -0.5 } else { 0.5 }),
                label: (i % 2).to_string(),
            })
            .collect();
        let images = ImageDataset::from_samples(samples);
        let targets = Array2::from_shape_fn((total, 2), |(r, c)| (r % 2 == c) as u8 as f32);
        let indices = SplitIndices {
            train: (0..train).collect(),
            test: (train..total).collect(),
        };
        DatasetSplit::new(&images, &targets, &indices)
    }

    fn small_config() -> TrainingConfig {
        TrainingConfig::new()
            .with_model(ModelConfig::new().with_width_multiplier(0.35).with_hidden_units(8))
            .with_batch_size(2)
            .with_epoch_count(2)
    }

    #[test]
    fn training_only_touches_the_head() {
        let device = Default::default();
        let config = small_config();
        let split = toy_split(4, 2);

        let backbone = config.model.init_backbone::<NdArray>(&device);
        let probe = Tensor::<NdArray, 4>::ones([1, 3, 224, 224], &device);
        let before: Vec<f32> = backbone.forward(probe.clone()).into_data().to_vec().unwrap();

        let trained = train::<TestBackend>(&config, backbone, 2, &split, &device).unwrap();
        let after: Vec<f32> = trained
            .model
            .backbone
            .forward(probe)
            .into_data()
            .to_vec()
            .unwrap();

        assert_eq!(before, after);
        assert_eq!(trained.history.len(), 2);
        assert!(trained.history.loss().iter().all(|l| l.is_finite()));
        assert!(trained.history.epochs[1].learning_rate < config.learning_rate);
    }

    #[test]
    fn batch_larger_than_split_is_rejected() {
        let device = Default::default();
        let config = small_config().with_batch_size(8);
        let split = toy_split(4, 2);
        let backbone = config.model.init_backbone::<NdArray>(&device);

        assert!(matches!(
            train::<TestBackend>(&config, backbone, 2, &split, &device),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn unreadable_image_stops_lazy_training() {
        let dir = TempDir::new().unwrap();
        let records = (0..6)
            .map(|i| {
                let path = dir.path().join(format!("{i}.png"));
                if i == 3 {
                    fs::write(&path, b"not a png").unwrap();
                } else {
                    RgbImage::from_pixel(8, 8, Rgb([40 * i as u8, 0, 0]))
                        .save(&path)
                        .unwrap();
                }
                ImageRecord {
                    path,
                    label: (i % 2).to_string(),
                }
            })
            .collect();
        let images = ImageDataset::on_demand(records);
        let targets = Array2::from_shape_fn((6, 2), |(r, c)| (r % 2 == c) as u8 as f32);
        let indices = SplitIndices {
            train: vec![0, 1, 2, 3],
            test: vec![4, 5],
        };
        let split = DatasetSplit::new(&images, &targets, &indices);

        let device = Default::default();
        let config = small_config();
        let backbone = config.model.init_backbone::<NdArray>(&device);

        assert!(matches!(
            train::<TestBackend>(&config, backbone, 2, &split, &device),
            Err(Error::Image { .. })
        ));
    }

    #[test]
    fn predictions_cover_partial_final_batch() {
        let device = Default::default();
        let config = small_config();
        let split = toy_split(2, 3);
        let model = config.model.init::<NdArray>(2, &device);

        let probs = predict(&model, &split.test_images, 2, &device).unwrap();
        assert_eq!(probs.dim(), (3, 2));
    }
}
