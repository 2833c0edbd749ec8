//! Error types for lora-trainer.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for lora-trainer operations.
pub type Result<T> = std::result::Result<T, LoraError>;

/// Errors that can occur while building, training or persisting adapters.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LoraError {
    /// Invalid adapter or training configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// An adapter module does not fit the base model's projection.
    #[error("module {module}: expected dimension {expected}, base model has {actual}")]
    Configuration {
        /// Fully-qualified module name.
        module: String,
        /// Dimension the adapter was configured with.
        expected: usize,
        /// Dimension reported by the base model.
        actual: usize,
    },

    /// Shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Writing an adapter container failed.
    #[error("failed to persist adapter to {}: {source}", path.display())]
    Persistence {
        /// Destination of the failed write.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Adapter container is malformed or not an adapter.
    #[error("adapter format error: {0}")]
    Format(String),

    /// The base-model collaborator failed.
    #[error("base model error: {0}")]
    BaseModel(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl LoraError {
    /// Wrap an I/O failure that happened while writing `path`.
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}
