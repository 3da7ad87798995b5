//! Error types for food_vit.

use std::path::PathBuf;

/// Result type alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while building, training, persisting or running a model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Filesystem access failed.
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An image file exists but could not be decoded.
    #[error("failed to decode image '{path}': {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("no valid images found in {0}")]
    NoImages(PathBuf),

    /// A tensor did not have the shape an operation requires.
    #[error("shape error: {0}")]
    Shape(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The weights file does not match the architecture it is loaded into.
    #[error("weights do not match model: {0}")]
    WeightMismatch(String),

    #[error("weights file is malformed: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("cannot run a forward pass on an empty batch")]
    EmptyBatch,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
