//! sdlora - LoRA fusion and pipeline composition for diffusion serving
//!
//! This crate loads a diffusion model from a diffusers-style directory of
//! safetensors files, fuses kohya-style LoRA adapters into its weights, and
//! runs text-to-image and image-to-image sampling with a per-request choice
//! of scheduler. Forward passes are delegated to a [`DiffusionRuntime`].
//!
//! ```no_run
//! use std::path::Path;
//! use sdlora::{load_model, GenerationRequest, LoadOptions, RawRequest, ServingConfig};
//!
//! # fn main() -> sdlora::Result<()> {
//! let config = ServingConfig::load(None)?;
//! let mut pipeline = load_model(
//!     Path::new("/models/sd15"),
//!     Some(Path::new("/adapters/style.safetensors")),
//!     &LoadOptions::from_config(&config)?,
//! )?;
//!
//! let request = GenerationRequest::normalize(RawRequest::default(), &config.limits());
//! let composed = pipeline.compose(&request);
//! println!("{} with {}", composed.mode(), composed.sampler());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod lora;
pub mod model;
pub mod pipeline;
pub mod request;

// Re-exports
pub use config::{Bounds, DeviceType, Precision, RequestLimits, ServingConfig};
pub use error::{Error, Result};
pub use lora::{fuse, read_adapter, AdapterTensorSet, FusionOptions, FusionReport};
pub use model::{load_model, load_weights, ComponentKind, LoadOptions, ModelWeights, SubModel};
pub use pipeline::runtime::DiffusionRuntime;
pub use pipeline::scheduler::{SamplerKind, Scheduler, SchedulerConfig};
pub use pipeline::{ComposedPipeline, Components, ModelPipeline, PipelineMode};
pub use request::{GenerationRequest, RawRequest};
