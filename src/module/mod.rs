//! MobileNetV2 building blocks.

pub mod conv2d_norm;
pub mod inverted_residual;
pub mod relu6;
