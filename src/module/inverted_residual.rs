use burn::prelude::*;

use super::conv2d_norm::{Conv2dNorm, Conv2dNormConfig};

/// Expand (1x1), filter (depthwise 3x3), project (1x1, linear), with a skip
/// connection when input and output shapes agree.
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<Conv2dNorm<B>>,
    depthwise: Conv2dNorm<B>,
    project: Conv2dNorm<B>,
    residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward(x);
        let x = self.project.forward(x);

        if self.residual {
            input + x
        } else {
            x
        }
    }
}

#[derive(Config, Debug)]
pub struct InvertedResidualConfig {
    pub channels: [usize; 2],
    pub stride: usize,
    pub expand_ratio: usize,
}

impl InvertedResidualConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> InvertedResidual<B> {
        let [input, output] = self.channels;
        let hidden = input * self.expand_ratio;

        let expand = (self.expand_ratio > 1)
            .then(|| Conv2dNormConfig::pointwise([input, hidden]).init(device));

        InvertedResidual {
            expand,
            depthwise: Conv2dNormConfig::depthwise(hidden, self.stride).init(device),
            project: Conv2dNormConfig::pointwise([hidden, output])
                .with_activate(false)
                .init(device),
            residual: self.stride == 1 && input == output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn skip_connection_only_when_shapes_match() {
        let device = Default::default();

        let same = InvertedResidualConfig::new([16, 16], 1, 6).init::<NdArray>(&device);
        let wider = InvertedResidualConfig::new([16, 24], 1, 6).init::<NdArray>(&device);
        let strided = InvertedResidualConfig::new([16, 16], 2, 6).init::<NdArray>(&device);

        assert!(same.residual);
        assert!(!wider.residual);
        assert!(!strided.residual);
    }

    #[test]
    fn unit_expansion_has_no_expand_layer() {
        let device = Default::default();
        let block = InvertedResidualConfig::new([32, 16], 1, 1).init::<NdArray>(&device);
        assert!(block.expand.is_none());

        let output = block.forward(Tensor::zeros([1, 32, 14, 14], &device));
        assert_eq!(output.dims(), [1, 16, 14, 14]);
    }

    #[test]
    fn stride_two_downsamples() {
        let device = Default::default();
        let block = InvertedResidualConfig::new([16, 24], 2, 6).init::<NdArray>(&device);

        let output = block.forward(Tensor::zeros([1, 16, 14, 14], &device));
        assert_eq!(output.dims(), [1, 24, 7, 7]);
    }
}
