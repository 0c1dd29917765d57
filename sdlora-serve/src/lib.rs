//! sdlora-serve
//!
//! Serving layer around the `sdlora` core:
//! - artifact retrieval for model and adapter identifiers
//! - request orchestration (normalize, compose, generate, persist)
//! - object storage and image handling
//! - the SageMaker-compatible HTTP surface and the `sdlora` CLI

pub mod cli;
pub mod error;
pub mod fetch;
pub mod imaging;
pub mod orchestrator;
pub mod server;
pub mod storage;

pub use error::{ServeError, ServeResult};
pub use fetch::{ArtifactFetcher, ArtifactLocation};
pub use orchestrator::Orchestrator;
pub use server::{router, AppState};
pub use storage::{LocalObjectStore, ObjectStore, ObjectUri};

/// Current version of sdlora-serve
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
