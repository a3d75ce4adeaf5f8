use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use image::{imageops::FilterType, ImageReader};
use ndarray::{Array1, Array2, Array3};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use walkdir::WalkDir;

use crate::error::{Error, Result};

pub const WIDTH: usize = 224;
pub const HEIGHT: usize = 224;
pub const CHANNEL_COUNT: usize = 3;

/// Decoded size of one sample in bytes.
pub const SAMPLE_BYTES: usize = WIDTH * HEIGHT * CHANNEL_COUNT * std::mem::size_of::<f32>();

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub label: String,
}

/// A normalised `HEIGHT x WIDTH x CHANNEL_COUNT` image and its class name.
#[derive(Debug, Clone)]
pub struct ImageSample {
    pub image: Array3<f32>,
    pub label: String,
}

/// Every image file below `data_dir`, labelled by its parent directory.
pub fn list_images(data_dir: &Path) -> Result<Vec<ImageRecord>> {
    if !data_dir.is_dir() {
        return Err(Error::DatasetNotFound(data_dir.to_path_buf()));
    }

    let mut paths = vec![];
    for entry in WalkDir::new(data_dir).into_iter() {
        let entry = entry?;
        if !entry.file_type().is_dir() && is_image(entry.path()) {
            paths.push(entry.into_path());
        }
    }

    if paths.is_empty() {
        return Err(Error::NoImages(data_dir.to_path_buf()));
    }
    paths.sort();

    Ok(paths
        .into_iter()
        .map(|path| {
            let label = path
                .parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            ImageRecord { path, label }
        })
        .collect())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// MobileNetV2 input scaling: `[0, 255]` to `[-1, 1]`.
pub fn preprocess_input(value: u8) -> f32 {
    value as f32 / 127.5 - 1.0
}

/// Decodes, resizes (nearest neighbour) and normalises one image.
pub fn load_image(path: &Path) -> Result<Array3<f32>> {
    let image_raw = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|source| Error::Image {
            path: path.to_path_buf(),
            source,
        })?;

    let image_raw = image_raw
        .resize_exact(WIDTH as u32, HEIGHT as u32, FilterType::Nearest)
        .to_rgb8();

    Ok(Array3::from_shape_fn(
        (HEIGHT, WIDTH, CHANNEL_COUNT),
        |(h, w, c)| preprocess_input(image_raw.get_pixel(w as u32, h as u32)[c]),
    ))
}

#[derive(Debug, Clone)]
enum Storage {
    InMemory(Vec<Arc<Array3<f32>>>),
    OnDemand,
}

/// Images either decoded up front or decoded each time they are read.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    records: Vec<ImageRecord>,
    storage: Storage,
}

impl ImageDataset {
    /// Decodes every record in parallel, unless the decoded set would exceed
    /// `memory_budget` bytes, in which case images are decoded on access.
    pub fn load(records: Vec<ImageRecord>, memory_budget: usize) -> Result<Self> {
        let estimate = records.len().saturating_mul(SAMPLE_BYTES);

        if estimate > memory_budget {
            tracing::info!(
                "{} images need ~{} MiB, over the {} MiB budget; decoding on demand",
                records.len(),
                estimate >> 20,
                memory_budget >> 20
            );
            return Ok(Self::on_demand(records));
        }

        let images = records
            .par_iter()
            .map(|record| load_image(&record.path).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            records,
            storage: Storage::InMemory(images),
        })
    }

    /// Wraps already decoded samples; they have no backing file.
    pub fn from_samples(samples: Vec<ImageSample>) -> Self {
        let (records, images) = samples
            .into_iter()
            .map(|sample| {
                let record = ImageRecord {
                    path: PathBuf::new(),
                    label: sample.label,
                };
                (record, Arc::new(sample.image))
            })
            .unzip();

        Self {
            records,
            storage: Storage::InMemory(images),
        }
    }

    pub fn on_demand(records: Vec<ImageRecord>) -> Self {
        Self {
            records,
            storage: Storage::OnDemand,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.storage, Storage::InMemory(_))
    }

    pub fn labels(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.label.as_str()).collect()
    }

    /// The samples at `indices`, in that order. In-memory images are shared.
    pub fn subset(&self, indices: &[usize]) -> Self {
        let records = indices.iter().map(|&i| self.records[i].clone()).collect();
        let storage = match &self.storage {
            Storage::InMemory(images) => {
                Storage::InMemory(indices.iter().map(|&i| images[i].clone()).collect())
            }
            Storage::OnDemand => Storage::OnDemand,
        };

        Self { records, storage }
    }

    /// Pairs the image at `index` with row `index` of `targets`.
    pub fn item(&self, index: usize, targets: &Array2<f32>) -> Result<FaceMaskItem> {
        let sample = self.try_get(index)?;
        Ok(FaceMaskItem {
            image: sample.image,
            target: targets.row(index).to_owned(),
        })
    }

    /// Like [`Dataset::get`], but a missing index or an unreadable file is an error.
    pub fn try_get(&self, index: usize) -> Result<ImageSample> {
        let record = self.records.get(index).ok_or_else(|| {
            Error::Training(format!("image {index} out of range for {} samples", self.records.len()))
        })?;

        let image = match &self.storage {
            Storage::InMemory(images) => images[index].as_ref().clone(),
            Storage::OnDemand => load_image(&record.path)?,
        };

        Ok(ImageSample {
            image,
            label: record.label.clone(),
        })
    }
}

impl Dataset<ImageSample> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageSample> {
        match self.try_get(index) {
            Ok(sample) => Some(sample),
            Err(err) => {
                if index < self.records.len() {
                    tracing::warn!("cannot read image {index}: {err}");
                }
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone)]
pub struct FaceMaskItem {
    pub image: Array3<f32>,
    pub target: Array1<f32>,
}

#[derive(Clone, Debug)]
pub struct FaceMaskBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 2>,
}

#[derive(Clone)]
pub struct FaceMaskBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> FaceMaskBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    /// Stacks `HWC` images into one `NCHW` tensor.
    pub fn images(&self, images: &[&Array3<f32>]) -> Tensor<B, 4> {
        let (height, width, channels) = images
            .first()
            .map_or((HEIGHT, WIDTH, CHANNEL_COUNT), |image| image.dim());

        let mut pixels = Vec::with_capacity(images.len() * channels * height * width);
        for image in images {
            pixels.extend(image.view().permuted_axes([2, 0, 1]).iter().copied());
        }

        Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [images.len(), channels, height, width])
                .convert::<B::FloatElem>(),
            &self.device,
        )
    }
}

impl<B: Backend> Batcher<FaceMaskItem, FaceMaskBatch<B>> for FaceMaskBatcher<B> {
    fn batch(&self, items: Vec<FaceMaskItem>) -> FaceMaskBatch<B> {
        let classes = items.first().map_or(0, |item| item.target.len());
        let images: Vec<_> = items.iter().map(|item| &item.image).collect();
        let targets: Vec<f32> = items
            .iter()
            .flat_map(|item| item.target.iter().copied())
            .collect();

        let images = self.images(&images);
        let targets = Tensor::<B, 2>::from_data(
            TensorData::new(targets, [items.len(), classes]).convert::<B::FloatElem>(),
            &self.device,
        );

        FaceMaskBatch { images, targets }
    }
}
