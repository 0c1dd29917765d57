//! Error types for the sdlora core

use thiserror::Error;

/// Main error type for model loading, fusion and generation
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An adapter layer path could not be matched against the model graph
    #[error("Cannot resolve adapter layer `{key}`: {reason}")]
    Resolution {
        /// Adapter layer key as found in the adapter file
        key: String,
        /// What went wrong during resolution
        reason: String,
    },

    /// Adapter factors are incompatible with each other or with the target weight
    #[error("Shape mismatch for adapter layer `{layer}`: {detail}")]
    ShapeMismatch {
        /// Adapter layer key
        layer: String,
        /// Description of the offending shapes
        detail: String,
    },

    /// An adapter layer is missing one of its low-rank factors
    #[error("Adapter layer `{layer}` has no `{element}` tensor")]
    MissingFactor {
        /// Adapter layer key
        layer: String,
        /// Missing element kind
        element: &'static str,
    },

    /// Model loading error
    #[error("Model loading error: {0}")]
    ModelLoading(String),

    /// Generation error
    #[error("Generation error: {0}")]
    Generation(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Safetensors parsing error
    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Image decoding or encoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for sdlora operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a resolution error for an adapter layer key
    pub fn resolution(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a shape mismatch error for an adapter layer key
    pub fn shape_mismatch(layer: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            layer: layer.into(),
            detail: detail.into(),
        }
    }

    /// Create a model loading error
    pub fn model_loading(msg: impl Into<String>) -> Self {
        Self::ModelLoading(msg.into())
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error comes from the adapter file itself (as opposed to I/O)
    pub fn is_adapter_error(&self) -> bool {
        matches!(
            self,
            Self::Resolution { .. } | Self::ShapeMismatch { .. } | Self::MissingFactor { .. }
        )
    }
}
