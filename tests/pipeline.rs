use std::{fs, path::Path};

use burn::backend::{Autodiff, NdArray};
use face_mask_detector::{
    model::ModelConfig,
    pipeline::{load_trained, run, RunOptions},
    training::TrainingConfig,
};
use image::{Rgb, RgbImage};
use tempfile::TempDir;

type TestBackend = Autodiff<NdArray>;

fn write_class(root: &Path, class: &str, count: usize, base: [u8; 3]) {
    let dir = root.join(class);
    fs::create_dir_all(&dir).unwrap();

    for i in 0..count {
        let image = RgbImage::from_fn(224, 224, |x, y| {
            let shade = ((x + y) as usize / 8 + i * 5) as u8;
            Rgb([
                base[0].wrapping_add(shade),
                base[1].wrapping_add(shade / 2),
                base[2],
            ])
        });
        image.save(dir.join(format!("{class}_{i:02}.png"))).unwrap();
    }
}

fn small_config() -> TrainingConfig {
    TrainingConfig::new()
        .with_model(
            ModelConfig::new()
                .with_width_multiplier(0.35)
                .with_hidden_units(8),
        )
        .with_batch_size(4)
        .with_epoch_count(2)
}

#[test]
fn toy_dataset_produces_model_plot_and_report() {
    let dir = TempDir::new().unwrap();
    let dataset = dir.path().join("dataset");
    write_class(&dataset, "mask", 10, [20, 120, 200]);
    write_class(&dataset, "no_mask", 10, [200, 90, 40]);

    let options = RunOptions {
        plot: dir.path().join("plots/plot.png"),
        model: dir.path().join("face_mask_detector.model"),
        ..RunOptions::new(&dataset)
    };
    let config = small_config();
    let device = Default::default();

    let summary = run::<TestBackend>(&options, &config, &device).unwrap();

    assert!(options.model.is_file());
    assert!(options.plot.is_file());
    assert!(summary.metadata_path.is_file());
    assert_eq!(summary.report.class_names(), vec!["mask", "no_mask"]);
    assert_eq!(summary.report.support, 4);
    assert_eq!(summary.history.len(), 2);

    let (model, metadata) = load_trained::<NdArray>(&options.model, &device).unwrap();
    assert_eq!(metadata.classes, vec!["mask", "no_mask"]);
    assert_eq!(metadata.config.batch_size, 4);

    let probs = model.forward(burn::tensor::Tensor::zeros([1, 3, 224, 224], &device));
    assert_eq!(probs.dims(), [1, 2]);
}

#[test]
fn missing_dataset_is_reported() {
    let dir = TempDir::new().unwrap();
    let options = RunOptions::new(dir.path().join("nowhere"));

    let result = run::<TestBackend>(&options, &small_config(), &Default::default());
    assert!(matches!(
        result,
        Err(face_mask_detector::Error::DatasetNotFound(_))
    ));
}
