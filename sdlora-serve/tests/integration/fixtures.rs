//! Synthetic model, adapter, configuration and runtime

use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use sdlora::lora::store::write_tensors;
use sdlora::model::save_scheduler_config;
use sdlora::{DiffusionRuntime, SchedulerConfig, ServingConfig, SubModel};
use sdlora_serve::{LocalObjectStore, Orchestrator};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const TE_Q_PROJ: &str = "text_model.encoder.layers.0.self_attn.q_proj.weight";

/// Create a temporary directory for test outputs
pub fn create_test_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().to_path_buf();
    (temp_dir, path)
}

fn write(path: &Path, tensors: &[(&str, Tensor)]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let tensors: BTreeMap<String, Tensor> = tensors
        .iter()
        .map(|(name, tensor)| (name.to_string(), tensor.clone()))
        .collect();
    write_tensors(path, &tensors).unwrap();
}

fn ones(shape: &[usize]) -> Tensor {
    Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
}

/// Tiny diffusers-layout model with all-ones weights
pub fn create_model(root: &Path) {
    write(
        &root.join("text_encoder/model.safetensors"),
        &[(TE_Q_PROJ, ones(&[4, 4]))],
    );
    write(
        &root.join("unet/diffusion_pytorch_model.safetensors"),
        &[("mid_block.attentions.0.proj_in.weight", ones(&[4, 4, 1, 1]))],
    );
    write(
        &root.join("vae/diffusion_pytorch_model.safetensors"),
        &[("decoder.conv_in.weight", ones(&[4, 4, 1, 1]))],
    );
    save_scheduler_config(&SchedulerConfig::default(), root).unwrap();
}

/// Rank-1 adapter on the text encoder's q_proj; fused delta is `multiplier`
pub fn create_adapter(path: &Path) {
    write(
        path,
        &[
            (
                "lora_te_text_model_encoder_layers_0_self_attn_q_proj.lora_up.weight",
                ones(&[4, 1]),
            ),
            (
                "lora_te_text_model_encoder_layers_0_self_attn_q_proj.lora_down.weight",
                ones(&[1, 4]),
            ),
        ],
    );
}

/// Configuration for a model under `root`, storing outputs in `root/store`
pub fn test_config(root: &Path) -> ServingConfig {
    ServingConfig {
        model_name: root.join("model").display().to_string(),
        lora_model: Some(root.join("adapter.safetensors").display().to_string()),
        s3_bucket: "outputs".to_string(),
        cache_dir: root.join("cache"),
        ..Default::default()
    }
}

/// Model, adapter and store on disk plus a loaded orchestrator
pub fn create_orchestrator(root: &Path, config: ServingConfig) -> Orchestrator {
    create_model(&root.join("model"));
    create_adapter(&root.join("adapter.safetensors"));
    Orchestrator::load(
        Arc::new(config),
        Arc::new(MockRuntime),
        Arc::new(LocalObjectStore::new(root.join("store"))),
    )
    .unwrap()
}

/// Request body for a small, fast generation
pub fn small_request() -> serde_json::Value {
    serde_json::json!({
        "prompt": "a lighthouse at dusk",
        "sampler": "ddim",
        "height": 64,
        "width": 64,
        "seed": 11,
    })
}

/// Runtime with trivial forward passes
pub struct MockRuntime;

impl DiffusionRuntime for MockRuntime {
    fn encode_prompt(&self, _text_encoder: &SubModel, _prompt: &str) -> sdlora::Result<Tensor> {
        Ok(Tensor::ones((1, 3, 8), DType::F32, &Device::Cpu)?)
    }

    fn predict_noise(
        &self,
        _unet: &SubModel,
        latents: &Tensor,
        _timestep: f64,
        _conditioning: &Tensor,
    ) -> sdlora::Result<Tensor> {
        Ok(latents.affine(0.1, 0.0)?)
    }

    fn encode_image(&self, _vae: &SubModel, image: &Tensor) -> sdlora::Result<Tensor> {
        let (_, _, height, width) = image.dims4()?;
        Ok(Tensor::zeros((1, 4, height / 8, width / 8), DType::F32, &Device::Cpu)?)
    }

    fn decode_latents(&self, _vae: &SubModel, latents: &Tensor) -> sdlora::Result<Tensor> {
        let (_, _, height, width) = latents.dims4()?;
        Ok(latents
            .narrow(1, 0, 3)?
            .upsample_nearest2d(height * 8, width * 8)?
            .tanh()?)
    }

    fn is_unsafe(&self, _image: &RgbImage) -> sdlora::Result<bool> {
        Ok(false)
    }
}
