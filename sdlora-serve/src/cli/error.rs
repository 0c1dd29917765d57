use colored::*;
use thiserror::Error;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileExists(std::path::PathBuf),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Print a user-friendly error message
    pub fn print_error(&self) {
        eprintln!("{} {}", "Error:".red().bold(), self);

        // Add helpful suggestions based on error type
        match self {
            CliError::Config(msg) if msg.contains("not found") => {
                eprintln!(
                    "\n{} Run {} to see the effective configuration",
                    "Hint:".yellow(),
                    "sdlora config show".cyan()
                );
            }
            CliError::FileNotFound(path) => {
                eprintln!(
                    "\n{} Make sure the file exists and the path is correct: {}",
                    "Hint:".yellow(),
                    path.cyan()
                );
            }
            CliError::FileExists(_) => {
                eprintln!("\n{} Pass {} to overwrite", "Hint:".yellow(), "--force".cyan());
            }
            CliError::Adapter(_) => {
                eprintln!(
                    "\n{} Run {} to see how each adapter key resolves",
                    "Hint:".yellow(),
                    "sdlora inspect".cyan()
                );
            }
            CliError::InvalidArgument(_) => {
                eprintln!(
                    "\n{} Use {} for more information",
                    "Hint:".yellow(),
                    "sdlora --help".cyan()
                );
            }
            _ => {}
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Serialization(err.to_string())
    }
}

impl From<sdlora::Error> for CliError {
    fn from(err: sdlora::Error) -> Self {
        match err {
            sdlora::Error::Config(msg) => CliError::Config(msg),
            err if err.is_adapter_error() => CliError::Adapter(err.to_string()),
            err => CliError::Model(err.to_string()),
        }
    }
}

impl From<crate::error::ServeError> for CliError {
    fn from(err: crate::error::ServeError) -> Self {
        match err {
            crate::error::ServeError::Core(err) => err.into(),
            crate::error::ServeError::Config(msg) => CliError::Config(msg),
            err => CliError::Fetch(err.to_string()),
        }
    }
}
