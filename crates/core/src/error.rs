use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("pdf error: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("unsupported input format: {0:?}")]
    UnsupportedInput(PathBuf),
    #[error("invalid position tag: {0}")]
    InvalidTag(String),
    #[error("page lookup failed for {path:?}: {reason}")]
    PageLookup { path: PathBuf, reason: String },
    #[error("other: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

impl From<anyhow::Error> for PolicyError {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(value.to_string())
    }
}
