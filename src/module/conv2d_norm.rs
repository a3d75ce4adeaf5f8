use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
};

use super::relu6::relu6;

/// Convolution, batch norm and, unless it is a linear projection, ReLU6.
#[derive(Module, Debug)]
pub struct Conv2dNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activate: bool,
}

impl<B: Backend> Conv2dNorm<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);

        if self.activate {
            relu6(x)
        } else {
            x
        }
    }
}

#[derive(Config, Debug)]
pub struct Conv2dNormConfig {
    channels: [usize; 2],

    kernel_size: usize,

    #[config(default = 1)]
    stride: usize,

    #[config(default = 1)]
    groups: usize,

    #[config(default = true)]
    activate: bool,
}

impl Conv2dNormConfig {
    /// 1x1 convolution.
    pub fn pointwise(channels: [usize; 2]) -> Self {
        Self::new(channels, 1)
    }

    /// 3x3 convolution with one group per channel.
    pub fn depthwise(channels: usize, stride: usize) -> Self {
        Self::new([channels, channels], 3)
            .with_stride(stride)
            .with_groups(channels)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Conv2dNorm<B> {
        let pad = self.kernel_size / 2;

        Conv2dNorm {
            conv: Conv2dConfig::new(self.channels, [self.kernel_size; 2])
                .with_stride([self.stride; 2])
                .with_padding(PaddingConfig2d::Explicit(pad, pad))
                .with_groups(self.groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(self.channels[1])
                .with_epsilon(1e-3)
                .with_momentum(0.001)
                .init(device),
            activate: self.activate,
        }
    }
}
