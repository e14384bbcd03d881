//! Error types for the SDM pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SdmError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid labels: {0}")]
    InvalidLabels(String),

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Too few labeled bags: need at least 2, got {0}")]
    TooFewLabeled(usize),

    #[error("Unknown divergence function: {0}")]
    UnknownDivergence(String),

    #[error("Divergence cache mismatch: {0}")]
    CacheMismatch(String),

    #[error("Empty dataset")]
    EmptyDataset,

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SdmError>;
