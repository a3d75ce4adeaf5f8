use burn::tensor::{activation::relu, backend::Backend, Tensor};

/// `min(max(x, 0), 6)`
pub fn relu6<B: Backend, const D: usize>(input: Tensor<B, D>) -> Tensor<B, D> {
    relu(input).clamp_max(6)
}
