//! Random affine augmentation of training images.
//!
//! Each sample gets a rotation, shift, shear and zoom composed about the image
//! centre, resampled bilinearly, then an optional horizontal flip. Shear is in
//! degrees. Shifts are fractions of the image size.

use burn::{config::Config, data::dataset::Dataset};
use ndarray::{arr2, Array2, Array3, Axis};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::{
    data::{FaceMaskItem, ImageDataset},
    error::Result,
};

/// How coordinates falling outside the source image are filled.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillMode {
    /// Repeat the edge pixel.
    Nearest,
    /// Use `cval`.
    Constant,
    /// Mirror about the edge.
    Reflect,
    /// Tile the image.
    Wrap,
}

#[derive(Config, Debug)]
pub struct AugmentationConfig {
    /// Degrees.
    #[config(default = 15.0)]
    pub rotation_range: f64,

    #[config(default = 0.2)]
    pub width_shift_range: f64,

    #[config(default = 0.2)]
    pub height_shift_range: f64,

    #[config(default = 0.1)]
    pub zoom_range: f64,

    /// Degrees.
    #[config(default = 0.1)]
    pub shear_range: f64,

    #[config(default = true)]
    pub horizontal_flip: bool,

    #[config(default = "FillMode::Nearest")]
    pub fill_mode: FillMode,

    #[config(default = 0.0)]
    pub cval: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParams {
    /// Rotation in degrees.
    pub theta: f64,
    /// Row shift in pixels.
    pub tx: f64,
    /// Column shift in pixels.
    pub ty: f64,
    /// Shear in degrees.
    pub shear: f64,
    pub zx: f64,
    pub zy: f64,
    pub flip_horizontal: bool,
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            theta: 0.0,
            tx: 0.0,
            ty: 0.0,
            shear: 0.0,
            zx: 1.0,
            zy: 1.0,
            flip_horizontal: false,
        }
    }
}

impl TransformParams {
    /// Maps output `(row, col, 1)` to input coordinates.
    fn matrix(&self, height: usize, width: usize) -> Array2<f64> {
        let theta = self.theta.to_radians();
        let shear = self.shear.to_radians();

        let rotation = arr2(&[
            [theta.cos(), -theta.sin(), 0.0],
            [theta.sin(), theta.cos(), 0.0],
            [0.0, 0.0, 1.0],
        ]);
        let shift = arr2(&[[1.0, 0.0, self.tx], [0.0, 1.0, self.ty], [0.0, 0.0, 1.0]]);
        let shear = arr2(&[
            [1.0, -shear.sin(), 0.0],
            [0.0, shear.cos(), 0.0],
            [0.0, 0.0, 1.0],
        ]);
        let zoom = arr2(&[[self.zx, 0.0, 0.0], [0.0, self.zy, 0.0], [0.0, 0.0, 1.0]]);

        let (o_x, o_y) = (height as f64 / 2.0 - 0.5, width as f64 / 2.0 - 0.5);
        let offset = arr2(&[[1.0, 0.0, o_x], [0.0, 1.0, o_y], [0.0, 0.0, 1.0]]);
        let reset = arr2(&[[1.0, 0.0, -o_x], [0.0, 1.0, -o_y], [0.0, 0.0, 1.0]]);

        offset
            .dot(&rotation)
            .dot(&shift)
            .dot(&shear)
            .dot(&zoom)
            .dot(&reset)
    }
}

#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn random_params<R: Rng>(&self, rng: &mut R, height: usize, width: usize) -> TransformParams {
        let config = &self.config;
        let mut symmetric = |range: f64| {
            if range > 0.0 {
                rng.gen_range(-range..=range)
            } else {
                0.0
            }
        };

        let theta = symmetric(config.rotation_range);
        let tx = symmetric(config.height_shift_range) * height as f64;
        let ty = symmetric(config.width_shift_range) * width as f64;
        let shear = symmetric(config.shear_range);
        let (zx, zy) = if config.zoom_range > 0.0 {
            let zoom = 1.0 - config.zoom_range..=1.0 + config.zoom_range;
            (rng.gen_range(zoom.clone()), rng.gen_range(zoom))
        } else {
            (1.0, 1.0)
        };
        let flip_horizontal = config.horizontal_flip && rng.gen::<f64>() < 0.5;

        TransformParams {
            theta,
            tx,
            ty,
            shear,
            zx,
            zy,
            flip_horizontal,
        }
    }

    /// Resamples an `H x W x C` image under `params`.
    pub fn apply(&self, image: &Array3<f32>, params: &TransformParams) -> Array3<f32> {
        let (height, width, channels) = image.dim();
        let m = params.matrix(height, width);
        let mut output = Array3::zeros(image.dim());

        for row in 0..height {
            for col in 0..width {
                let (r, c) = (row as f64, col as f64);
                let src_row = m[[0, 0]] * r + m[[0, 1]] * c + m[[0, 2]];
                let src_col = m[[1, 0]] * r + m[[1, 1]] * c + m[[1, 2]];

                for channel in 0..channels {
                    output[[row, col, channel]] = self.sample(image, src_row, src_col, channel);
                }
            }
        }

        if params.flip_horizontal {
            output.invert_axis(Axis(1));
        }

        output
    }

    fn sample(&self, image: &Array3<f32>, row: f64, col: f64, channel: usize) -> f32 {
        let (height, width, _) = image.dim();
        let (r0, c0) = (row.floor(), col.floor());
        let (fr, fc) = ((row - r0) as f32, (col - c0) as f32);
        let (r0, c0) = (r0 as i64, c0 as i64);

        let mut value = 0.0;
        for (dr, wr) in [(0, 1.0 - fr), (1, fr)] {
            for (dc, wc) in [(0, 1.0 - fc), (1, fc)] {
                let weight = wr * wc;
                if weight == 0.0 {
                    continue;
                }
                let tap = match (
                    self.resolve(r0 + dr, height),
                    self.resolve(c0 + dc, width),
                ) {
                    (Some(r), Some(c)) => image[[r, c, channel]],
                    _ => self.config.cval,
                };
                value += weight * tap;
            }
        }
        value
    }

    fn resolve(&self, index: i64, len: usize) -> Option<usize> {
        let n = len as i64;
        if (0..n).contains(&index) {
            return Some(index as usize);
        }

        match self.config.fill_mode {
            FillMode::Nearest => Some(index.clamp(0, n - 1) as usize),
            FillMode::Constant => None,
            FillMode::Reflect => {
                let period = 2 * n;
                let i = index.rem_euclid(period);
                let mirrored = if i < n { i } else { period - 1 - i };
                Some(mirrored as usize)
            }
            FillMode::Wrap => Some(index.rem_euclid(n) as usize),
        }
    }

    /// Infinite stream of augmented batches drawn from `images`/`targets`.
    pub fn flow<'a>(
        &self,
        images: &'a ImageDataset,
        targets: &'a Array2<f32>,
        batch_size: usize,
        seed: u64,
    ) -> AugmentedBatches<'a> {
        AugmentedBatches::new(self.clone(), images, targets, batch_size, seed)
    }
}

/// Never-ending sequence of `batch_size` augmented items.
///
/// Walks a seeded permutation of the training set and reshuffles whenever it
/// runs out, so a batch may straddle two passes.
pub struct AugmentedBatches<'a> {
    augmenter: Augmenter,
    images: &'a ImageDataset,
    targets: &'a Array2<f32>,
    batch_size: usize,
    seed: u64,
    rng: ChaCha8Rng,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a> AugmentedBatches<'a> {
    fn new(
        augmenter: Augmenter,
        images: &'a ImageDataset,
        targets: &'a Array2<f32>,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        let mut batches = Self {
            augmenter,
            images,
            targets,
            batch_size,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            order: (0..images.len()).collect(),
            cursor: 0,
        };
        batches.reset();
        batches
    }

    /// Restarts the stream from its first batch.
    pub fn reset(&mut self) {
        self.rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.order = (0..self.images.len()).collect();
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
    }

    fn next_index(&mut self) -> usize {
        if self.cursor == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        self.cursor += 1;
        self.order[self.cursor - 1]
    }
}

impl Iterator for AugmentedBatches<'_> {
    type Item = Result<Vec<FaceMaskItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.order.is_empty() || self.batch_size == 0 {
            return None;
        }

        let mut picked = Vec::with_capacity(self.batch_size);
        while picked.len() < self.batch_size {
            let index = self.next_index();
            match self.images.item(index, self.targets) {
                Ok(item) => picked.push(item),
                Err(err) => return Some(Err(err)),
            }
        }

        let jobs: Vec<_> = picked
            .into_iter()
            .map(|item| {
                let (height, width, _) = item.image.dim();
                let params = self.augmenter.random_params(&mut self.rng, height, width);
                (item, params)
            })
            .collect();

        let augmenter = &self.augmenter;
        Some(Ok(jobs
            .into_par_iter()
            .map(|(item, params)| FaceMaskItem {
                image: augmenter.apply(&item.image, &params),
                target: item.target,
            })
            .collect()))
    }
}
