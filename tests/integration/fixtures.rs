//! Synthetic models, adapters and a mock runtime

use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use sdlora::lora::store::write_tensors;
use sdlora::model::save_scheduler_config;
use sdlora::{DiffusionRuntime, Result, SchedulerConfig, SubModel};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

pub const TE_Q_PROJ: &str = "text_model.encoder.layers.0.self_attn.q_proj.weight";
pub const UNET_PROJ_IN: &str = "down_blocks.0.attentions.0.proj_in.weight";
pub const UNET_TO_Q: &str = "mid_block.attentions.0.transformer_blocks.0.attn1.to_q.weight";
pub const VAE_CONV_IN: &str = "decoder.conv_in.weight";

/// Create a temporary directory for test outputs
pub fn create_test_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().to_path_buf();
    (temp_dir, path)
}

fn write(dir: &Path, file: &str, tensors: Vec<(&str, Tensor)>) {
    std::fs::create_dir_all(dir).unwrap();
    let tensors: BTreeMap<String, Tensor> = tensors
        .into_iter()
        .map(|(name, tensor)| (name.to_string(), tensor))
        .collect();
    write_tensors(dir.join(file), &tensors).unwrap();
}

/// Write a tiny diffusers-style model: every weight is ones
pub fn create_model(root: &Path) {
    let device = Device::Cpu;
    let ones = |shape: &[usize]| Tensor::ones(shape, DType::F32, &device).unwrap();

    write(
        &root.join("text_encoder"),
        "model.safetensors",
        vec![
            (TE_Q_PROJ, ones(&[4, 4])),
            ("text_model.encoder.layers.0.self_attn.q_proj.bias", ones(&[4])),
            ("text_model.final_layer_norm.weight", ones(&[4])),
        ],
    );
    write(
        &root.join("unet"),
        "diffusion_pytorch_model.safetensors",
        vec![
            (UNET_PROJ_IN, ones(&[6, 5, 1, 1])),
            (UNET_TO_Q, ones(&[4, 4])),
            ("conv_in.weight", ones(&[8, 4, 3, 3])),
        ],
    );
    write(
        &root.join("vae"),
        "diffusion_pytorch_model.safetensors",
        vec![(VAE_CONV_IN, ones(&[4, 4, 1, 1]))],
    );

    save_scheduler_config(&SchedulerConfig::default(), root).unwrap();
}

/// Adapter targeting one text encoder and two unet layers
pub fn adapter_tensors() -> Vec<(&'static str, Tensor)> {
    let device = Device::Cpu;
    let ones = |shape: &[usize]| Tensor::ones(shape, DType::F32, &device).unwrap();
    vec![
        (
            "lora_te_text_model_encoder_layers_0_self_attn_q_proj.lora_up.weight",
            ones(&[4, 2]),
        ),
        (
            "lora_te_text_model_encoder_layers_0_self_attn_q_proj.lora_down.weight",
            ones(&[2, 4]),
        ),
        (
            "lora_te_text_model_encoder_layers_0_self_attn_q_proj.alpha",
            Tensor::new(1f32, &device).unwrap(),
        ),
        (
            "lora_unet_down_blocks_0_attentions_0_proj_in.lora_up.weight",
            ones(&[6, 2, 1, 1]),
        ),
        (
            "lora_unet_down_blocks_0_attentions_0_proj_in.lora_down.weight",
            ones(&[2, 5, 1, 1]),
        ),
        (
            "lora_unet_mid_block_attentions_0_transformer_blocks_0_attn1_to_q.lora_up.weight",
            ones(&[4, 2]),
        ),
        (
            "lora_unet_mid_block_attentions_0_transformer_blocks_0_attn1_to_q.lora_down.weight",
            ones(&[2, 4]),
        ),
    ]
}

/// Write an adapter file and return its path
pub fn create_adapter(dir: &Path, name: &str, tensors: Vec<(&str, Tensor)>) -> PathBuf {
    write(dir, name, tensors);
    dir.join(name)
}

/// Runtime with trivial forward passes
#[derive(Default)]
pub struct MockRuntime {
    pub flag_unsafe: bool,
    pub unet_calls: AtomicUsize,
}

impl DiffusionRuntime for MockRuntime {
    fn encode_prompt(&self, _text_encoder: &SubModel, prompt: &str) -> Result<Tensor> {
        let value = prompt.len() as f32 / 100.0;
        Ok(Tensor::full(value, (1, 3, 8), &Device::Cpu)?)
    }

    fn predict_noise(
        &self,
        _unet: &SubModel,
        latents: &Tensor,
        _timestep: f64,
        _conditioning: &Tensor,
    ) -> Result<Tensor> {
        self.unet_calls.fetch_add(1, Ordering::SeqCst);
        Ok(latents.affine(0.1, 0.0)?)
    }

    fn encode_image(&self, _vae: &SubModel, image: &Tensor) -> Result<Tensor> {
        let (_, _, height, width) = image.dims4()?;
        Ok(Tensor::zeros((1, 4, height / 8, width / 8), DType::F32, &Device::Cpu)?)
    }

    fn decode_latents(&self, _vae: &SubModel, latents: &Tensor) -> Result<Tensor> {
        let (_, _, height, width) = latents.dims4()?;
        Ok(latents
            .narrow(1, 0, 3)?
            .upsample_nearest2d(height * 8, width * 8)?
            .tanh()?)
    }

    fn is_unsafe(&self, _image: &RgbImage) -> Result<bool> {
        Ok(self.flag_unsafe)
    }
}
