pub mod commands;
pub mod config;
pub mod error;
pub mod logging;

// Re-export command structures
pub use commands::{
    fuse::FuseCommand,
    inspect::InspectCommand,
    normalize::NormalizeCommand,
};

// Re-export error types
pub use error::{CliError, CliResult};
