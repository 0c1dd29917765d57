//! Errors of the serving collaborators

use thiserror::Error;

pub type ServeResult<T> = Result<T, ServeError>;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Remote fetch error: {0}")]
    RemoteFetch(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] sdlora::Error),
}

impl ServeError {
    pub fn remote_fetch(msg: impl Into<String>) -> Self {
        Self::RemoteFetch(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable machine-readable code for HTTP error bodies
    pub fn code(&self) -> &'static str {
        match self {
            ServeError::RemoteFetch(_) | ServeError::Http(_) => "REMOTE_FETCH_ERROR",
            ServeError::Storage(_) | ServeError::Io(_) => "STORAGE_ERROR",
            ServeError::Config(_) => "CONFIGURATION_ERROR",
            ServeError::Image(_) => "IMAGE_ERROR",
            ServeError::Serialization(_) => "SERIALIZATION_ERROR",
            ServeError::Core(err) => match err {
                sdlora::Error::InvalidInput(_) => "INVALID_INPUT",
                sdlora::Error::Generation(_) | sdlora::Error::Tensor(_) => "GENERATION_ERROR",
                err if err.is_adapter_error() => "ADAPTER_ERROR",
                _ => "INTERNAL_ERROR",
            },
        }
    }
}
