use std::path::PathBuf;

use policy_rag_core::PolicyError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    #[error(transparent)]
    Core(#[from] PolicyError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("rasterizing {path:?} failed: {reason}")]
    Rasterize { path: PathBuf, reason: String },
    #[error("no rendered image for page index {page_index} ({rendered} pages rendered)")]
    MissingPage { page_index: usize, rendered: usize },
    #[error("other: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl From<anyhow::Error> for RagError {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(value.to_string())
    }
}
