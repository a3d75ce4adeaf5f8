use std::{fs, path::Path};

use burn::{
    nn::{
        pool::{AvgPool2d, AvgPool2dConfig},
        Dropout, DropoutConfig, Initializer, Linear, LinearConfig,
    },
    prelude::*,
    record::{CompactRecorder, FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::activation::{relu, softmax},
};

use crate::{
    error::{Error, Result},
    module::{
        conv2d_norm::{Conv2dNorm, Conv2dNormConfig},
        inverted_residual::{InvertedResidual, InvertedResidualConfig},
    },
};

const INVERTED_RESIDUAL_SETTINGS: [[usize; 4]; 7] = [
    // t = expansion factor, c = channels, n = blocks, s = stride of the first block
    [1, 16, 1, 1],
    [6, 24, 2, 2],
    [6, 32, 3, 2],
    [6, 64, 4, 2],
    [6, 96, 3, 1],
    [6, 160, 3, 2],
    [6, 320, 1, 1],
];

const FIRST_CHANNELS: usize = 32;
const LAST_CHANNELS: usize = 1280;

/// Rounds `value` to a multiple of `divisor` without going more than 10% below it.
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let d = divisor as f64;
    let rounded = (((value + d / 2.0) as usize) / divisor * divisor).max(divisor);
    if (rounded as f64) < 0.9 * value {
        rounded + divisor
    } else {
        rounded
    }
}

#[derive(Module, Debug)]
enum Conv2dBlock<B: Backend> {
    Conv(Conv2dNorm<B>),
    InvertedResidual(InvertedResidual<B>),
}

impl<B: Backend> Conv2dBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Conv2dBlock::Conv(conv2d_norm) => conv2d_norm.forward(x),
            Conv2dBlock::InvertedResidual(inverted_residual) => inverted_residual.forward(x),
        }
    }
}

/// MobileNetV2 feature extractor without its classification top.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    blocks: Vec<Conv2dBlock<B>>,
}

impl<B: Backend> Backbone<B> {
    /// `[N, 3, 224, 224]` to `[N, 1280, 7, 7]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    /// Replaces the weights with a record saved by `CompactRecorder`.
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self> {
        self.load_file(path, &CompactRecorder::new(), device)
            .map_err(|e| Error::Record(format!("{}: {e:?}", path.display())))
    }
}

/// Pool, flatten, ReLU hidden layer, dropout, softmax output.
#[derive(Module, Debug)]
pub struct Head<B: Backend> {
    pool: AvgPool2d,
    hidden: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> Head<B> {
    /// Class probabilities, `[N, classes]`.
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(features);
        let x = x.flatten(1, 3);
        let x = relu(self.hidden.forward(x));
        let x = self.dropout.forward(x);
        softmax(self.output.forward(x), 1)
    }
}

/// Frozen backbone plus trainable head.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    pub backbone: Backbone<B>,
    pub head: Head<B>,
}

impl<B: Backend> Model<B> {
    pub fn new(backbone: Backbone<B>, head: Head<B>) -> Self {
        Self { backbone, head }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 128)]
    pub hidden_units: usize,

    #[config(default = 0.5)]
    pub dropout: f64,

    #[config(default = 1.0)]
    pub width_multiplier: f64,

    /// Backbone output side length for 224x224 inputs.
    #[config(default = 7)]
    pub pool_size: usize,
}

impl ModelConfig {
    pub fn feature_channels(&self) -> usize {
        if self.width_multiplier > 1.0 {
            make_divisible(LAST_CHANNELS as f64 * self.width_multiplier, 8)
        } else {
            LAST_CHANNELS
        }
    }

    pub fn init_backbone<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let alpha = self.width_multiplier;
        let mut channels = make_divisible(FIRST_CHANNELS as f64 * alpha, 8);
        let mut blocks = vec![Conv2dBlock::Conv(
            Conv2dNormConfig::new([3, channels], 3)
                .with_stride(2)
                .init(device),
        )];

        for [t, c, n, s] in INVERTED_RESIDUAL_SETTINGS {
            let output = make_divisible((c as f64 * alpha).trunc(), 8);

            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                blocks.push(Conv2dBlock::InvertedResidual(
                    InvertedResidualConfig::new([channels, output], stride, t).init(device),
                ));
                channels = output;
            }
        }

        blocks.push(Conv2dBlock::Conv(
            Conv2dNormConfig::pointwise([channels, self.feature_channels()]).init(device),
        ));

        Backbone { blocks }
    }

    pub fn init_head<B: Backend>(&self, classes: usize, device: &B::Device) -> Head<B> {
        let glorot = Initializer::XavierUniform { gain: 1.0 };

        Head {
            pool: AvgPool2dConfig::new([self.pool_size; 2])
                .with_strides([self.pool_size; 2])
                .init(),
            hidden: LinearConfig::new(self.feature_channels(), self.hidden_units)
                .with_initializer(glorot.clone())
                .init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_units, classes)
                .with_initializer(glorot)
                .init(device),
        }
    }

    pub fn init<B: Backend>(&self, classes: usize, device: &B::Device) -> Model<B> {
        Model::new(self.init_backbone(device), self.init_head(classes, device))
    }
}

/// Writes the full-precision record of `model` to exactly `path`.
pub fn save_model<B: Backend>(model: Model<B>, path: &Path) -> Result<()> {
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
    let bytes = Recorder::<B>::record(&recorder, model.into_record(), ())
        .map_err(|e| Error::Record(format!("{e:?}")))?;

    fs::write(path, bytes)?;
    Ok(())
}

/// Reads a model written by [`save_model`] into a freshly built `Model`.
pub fn load_model<B: Backend>(
    config: &ModelConfig,
    classes: usize,
    path: &Path,
    device: &B::Device,
) -> Result<Model<B>> {
    let bytes = fs::read(path)?;
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
    let record: ModelRecord<B> = Recorder::<B>::load(&recorder, bytes, device)
        .map_err(|e| Error::Record(format!("{}: {e:?}", path.display())))?;

    Ok(config.init::<B>(classes, device).load_record(record))
}
