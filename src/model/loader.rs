//! Loading models from a diffusers directory layout
//!
//! ```text
//! <model>/
//!   text_encoder/model.safetensors
//!   unet/diffusion_pytorch_model.safetensors
//!   vae/diffusion_pytorch_model.safetensors
//!   scheduler/scheduler_config.json
//! ```
//!
//! Sharded weights (`*-00001-of-00002.safetensors`) are merged. Precision
//! variants (`*.fp16.safetensors`) are used only when no plain file exists.

use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::config::ServingConfig;
use crate::error::{Error, Result};
use crate::lora::fusion::{fuse, FusionOptions};
use crate::lora::{read_adapter, store};
use crate::model::{ComponentKind, ModelWeights, SubModel};
use crate::pipeline::scheduler::SchedulerConfig;
use crate::pipeline::ModelPipeline;

const SCHEDULER_CONFIG: &str = "scheduler/scheduler_config.json";

/// How a model is loaded and fused
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Device weights are placed on
    pub device: Device,
    /// Precision floating point weights are converted to
    pub dtype: DType,
    /// Adapter fusion settings
    pub fusion: FusionOptions,
    /// Whether generated images go through the safety screen
    pub safety_checker: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
            fusion: FusionOptions::default(),
            safety_checker: false,
        }
    }
}

impl LoadOptions {
    /// Options derived from the serving configuration
    pub fn from_config(config: &ServingConfig) -> Result<Self> {
        Ok(Self {
            device: config.device.device()?,
            dtype: config.precision.dtype(),
            fusion: FusionOptions::with_multiplier(config.lora_multiplier),
            safety_checker: config.safety_checker_enable,
        })
    }
}

/// Load the weights of every sub-model
#[instrument(skip_all, fields(dir = %model_dir.display()))]
pub fn load_weights(model_dir: &Path, device: &Device, dtype: DType) -> Result<ModelWeights> {
    if !model_dir.is_dir() {
        return Err(Error::model_loading(format!(
            "Model directory not found: {}",
            model_dir.display()
        )));
    }

    let load = |kind: ComponentKind| load_component(model_dir, kind, device, dtype);
    let weights = ModelWeights::new(
        load(ComponentKind::TextEncoder)?,
        load(ComponentKind::Unet)?,
        load(ComponentKind::Vae)?,
    );

    info!(
        "Loaded model from {} ({} parameters)",
        model_dir.display(),
        weights.num_parameters()
    );
    Ok(weights)
}

fn load_component(
    model_dir: &Path,
    kind: ComponentKind,
    device: &Device,
    dtype: DType,
) -> Result<SubModel> {
    let dir = model_dir.join(kind.dir_name());
    let files = weight_files(&dir)?;
    let mut params = BTreeMap::new();

    for file in &files {
        for (name, tensor) in store::read_tensors(file, device)? {
            let tensor = if tensor.dtype().is_float() && tensor.dtype() != dtype {
                tensor.to_dtype(dtype)?
            } else {
                tensor
            };
            if params.insert(name.clone(), tensor).is_some() {
                return Err(Error::model_loading(format!(
                    "Tensor `{}` appears in more than one shard of {}",
                    name,
                    dir.display()
                )));
            }
        }
    }

    let sub_model = SubModel::new(kind, params);
    debug!(
        "Loaded {} from {} file(s): {} tensors, {} addressable modules",
        kind,
        files.len(),
        sub_model.len(),
        sub_model.addressable_modules()
    );
    Ok(sub_model)
}

fn weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        Error::model_loading(format!("Cannot read {}: {}", dir.display(), e))
    })?;

    let mut plain = Vec::new();
    let mut variants = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("safetensors") {
            continue;
        }
        let is_variant = path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| stem.contains('.'));
        if is_variant {
            variants.push(path);
        } else {
            plain.push(path);
        }
    }

    let mut files = if plain.is_empty() { variants } else { plain };
    if files.is_empty() {
        return Err(Error::model_loading(format!(
            "No .safetensors weights in {}",
            dir.display()
        )));
    }
    files.sort();
    Ok(files)
}

/// Read `scheduler/scheduler_config.json`, or the default schedule if absent
pub fn load_scheduler_config(model_dir: &Path) -> Result<SchedulerConfig> {
    let path = model_dir.join(SCHEDULER_CONFIG);
    if !path.exists() {
        warn!(
            "No scheduler configuration at {}, using the default schedule",
            path.display()
        );
        return Ok(SchedulerConfig::default());
    }

    let config: SchedulerConfig = serde_json::from_str(&fs::read_to_string(&path)?)?;
    config.validate()?;
    Ok(config)
}

/// Load a model, fuse an optional adapter, and freeze it into a pipeline.
///
/// Fusion completes before the pipeline exists; if it fails nothing is
/// returned.
pub fn load_model(
    model_dir: &Path,
    adapter: Option<&Path>,
    options: &LoadOptions,
) -> Result<ModelPipeline> {
    let scheduler_config = load_scheduler_config(model_dir)?;
    let mut weights = load_weights(model_dir, &options.device, options.dtype)?;

    if let Some(adapter) = adapter {
        let tensors = read_adapter(adapter, &options.device)?;
        fuse(&mut weights, &tensors, &options.fusion)?;
    }

    Ok(ModelPipeline::new(weights, scheduler_config)?.with_safety_checker(options.safety_checker))
}

/// Write weights back out in the same directory layout
pub fn save_weights(weights: &ModelWeights, out_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for kind in ComponentKind::ALL {
        let dir = out_dir.join(kind.dir_name());
        fs::create_dir_all(&dir)?;
        let file = dir.join(match kind {
            ComponentKind::TextEncoder => "model.safetensors",
            _ => "diffusion_pytorch_model.safetensors",
        });

        let tensors: BTreeMap<String, Tensor> = weights
            .component(kind)
            .tensors()
            .map(|(name, tensor)| (name.to_string(), tensor.clone()))
            .collect();
        store::write_tensors(&file, &tensors)?;
        written.push(file);
    }
    info!("Wrote weights to {}", out_dir.display());
    Ok(written)
}

/// Write a scheduler configuration in the directory layout
pub fn save_scheduler_config(config: &SchedulerConfig, out_dir: &Path) -> Result<PathBuf> {
    let path = out_dir.join(SCHEDULER_CONFIG);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_string_pretty(config)?)?;
    Ok(path)
}
