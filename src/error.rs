use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to walk dataset directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("dataset directory not found: {0}")]
    DatasetNotFound(PathBuf),

    #[error("no images found under {0}")]
    NoImages(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot split dataset: {0}")]
    Split(String),

    #[error("label `{0}` was not seen when the encoder was fitted")]
    UnknownLabel(String),

    #[error("tensor data error: {0}")]
    Tensor(String),

    #[error("model record error: {0}")]
    Record(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("plot error: {0}")]
    Plot(String),

    #[error("training error: {0}")]
    Training(String),
}
