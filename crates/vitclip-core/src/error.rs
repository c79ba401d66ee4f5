use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackboneError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("adaptation type not implemented: {0}")]
    Unimplemented(String),

    #[error("pretrained must be a str or None")]
    InvalidPretrained,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("frame count mismatch: {got} != {expected}")]
    FrameMismatch { expected: i64, got: i64 },

    #[error("shape error: {0}")]
    Shape(String),

    #[error("pretrained weights not found: {0}")]
    MissingWeights(PathBuf),

    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),
}

pub type Result<T> = std::result::Result<T, BackboneError>;
