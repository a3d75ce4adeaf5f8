pub mod augment;
pub mod data;
pub mod error;
pub mod label;
pub mod logging;
pub mod model;
pub mod module;
pub mod pipeline;
pub mod plot;
pub mod report;
pub mod schedule;
pub mod split;
pub mod training;

pub use error::{Error, Result};
