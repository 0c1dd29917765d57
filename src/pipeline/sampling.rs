//! Sampling loop with classifier-free guidance

use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pipeline::runtime::DiffusionRuntime;
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::Components;
use crate::request::GenerationRequest;

/// Classifier-free guidance scale
pub const GUIDANCE_SCALE: f64 = 7.5;
/// Scaling between VAE latents and diffusion latents
pub const VAE_SCALE: f64 = 0.18215;
/// Share of the schedule re-noised for image-to-image
pub const IMG2IMG_STRENGTH: f64 = 0.8;
/// Spatial downsampling of the VAE
pub const LATENT_FACTOR: usize = 8;

/// Seeded source of standard normal noise
#[derive(Debug)]
pub struct NoiseSource {
    rng: StdRng,
}

impl NoiseSource {
    /// Deterministic noise for `seed`
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `f32` standard normal tensor of `shape`
    pub fn randn(&mut self, shape: &[usize], device: &Device) -> Result<Tensor> {
        let len = shape.iter().product();
        let values: Vec<f32> = (0..len)
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(values, shape, device)?)
    }

    /// Standard normal tensor with the shape, device and dtype of `like`
    pub fn randn_like(&mut self, like: &Tensor) -> Result<Tensor> {
        Ok(self.randn(like.dims(), like.device())?.to_dtype(like.dtype())?)
    }
}

/// Run the full denoising loop for one normalized request
pub(crate) fn run(
    runtime: &dyn DiffusionRuntime,
    components: &Components,
    scheduler: &mut dyn Scheduler,
    request: &GenerationRequest,
    init_image: Option<&RgbImage>,
    safety_checker: bool,
) -> Result<Vec<RgbImage>> {
    scheduler.set_timesteps(request.steps())?;
    let conditioning = conditioning(runtime, components, request)?;
    let device = conditioning.device().clone();
    let mut noise = NoiseSource::seeded(request.seed());

    let mut latents = match init_image {
        None => {
            let shape = [
                request.count(),
                runtime.latent_channels(),
                request.height() / LATENT_FACTOR,
                request.width() / LATENT_FACTOR,
            ];
            noise
                .randn(&shape, &device)?
                .affine(scheduler.init_noise_sigma(), 0.0)?
        }
        Some(image) => {
            let pixels = image_to_tensor(image, &device)?;
            let encoded = runtime
                .encode_image(&components.vae, &pixels)?
                .to_dtype(DType::F32)?
                .affine(VAE_SCALE, 0.0)?;
            let init = repeat_batch(&encoded, request.count())?;

            let steps = request.steps();
            let init_steps = ((steps as f64 * IMG2IMG_STRENGTH) as usize).clamp(1, steps);
            let begin = steps - init_steps;
            scheduler.set_begin_step(begin)?;
            let fresh = noise.randn(init.dims(), &device)?;
            scheduler.add_noise(&init, &fresh, begin)?
        }
    };

    debug!(
        "Sampling {} evaluations with {} from index {}",
        scheduler.timesteps().len(),
        scheduler.kind(),
        scheduler.step_index()
    );

    while !scheduler.is_finished() {
        let timestep = scheduler.timesteps()[scheduler.step_index()];
        let input = Tensor::cat(&[&latents, &latents], 0)?;
        let input = scheduler.scale_model_input(&input)?;

        let prediction = runtime
            .predict_noise(&components.unet, &input, timestep, &conditioning)?
            .to_dtype(DType::F32)?;
        let guided = guide(&prediction)?;
        latents = scheduler.step(&guided, &latents, &mut noise)?;
    }

    let decoded = runtime.decode_latents(&components.vae, &latents.affine(1.0 / VAE_SCALE, 0.0)?)?;
    let mut images = tensor_to_images(&decoded)?;

    if safety_checker {
        for (i, image) in images.iter_mut().enumerate() {
            if runtime.is_unsafe(image)? {
                warn!("Image {} flagged by the safety checker, replaced with black", i);
                *image = RgbImage::new(image.width(), image.height());
            }
        }
    }

    Ok(images)
}

/// `[uncond × count, cond × count]` prompt embeddings
fn conditioning(
    runtime: &dyn DiffusionRuntime,
    components: &Components,
    request: &GenerationRequest,
) -> Result<Tensor> {
    let cond = runtime.encode_prompt(&components.text_encoder, request.prompt())?;
    let uncond = runtime.encode_prompt(&components.text_encoder, request.negative_prompt())?;
    if cond.dims() != uncond.dims() {
        return Err(Error::generation(format!(
            "prompt embeddings {:?} and negative prompt embeddings {:?} differ in shape",
            cond.dims(),
            uncond.dims()
        )));
    }
    let count = request.count();
    Ok(Tensor::cat(
        &[repeat_batch(&uncond, count)?, repeat_batch(&cond, count)?],
        0,
    )?)
}

fn guide(prediction: &Tensor) -> Result<Tensor> {
    let chunks = prediction.chunk(2, 0)?;
    let (uncond, cond) = match chunks.as_slice() {
        [uncond, cond] => (uncond, cond),
        _ => {
            return Err(Error::generation(format!(
                "expected a guidance batch of two halves, got {:?}",
                prediction.dims()
            )))
        }
    };
    Ok(uncond.add(&cond.sub(uncond)?.affine(GUIDANCE_SCALE, 0.0)?)?)
}

fn repeat_batch(tensor: &Tensor, count: usize) -> Result<Tensor> {
    if count == 1 {
        return Ok(tensor.clone());
    }
    Ok(Tensor::cat(&vec![tensor.clone(); count], 0)?)
}

/// RGB image → `(1, 3, H, W)` `f32` tensor in `[-1, 1]`
pub fn image_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let tensor = Tensor::from_vec(image.as_raw().clone(), (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2.0 / 255.0, -1.0)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// `(B, 3, H, W)` tensor in `[-1, 1]` → RGB images
pub fn tensor_to_images(tensor: &Tensor) -> Result<Vec<RgbImage>> {
    let (batch, channels, height, width) = tensor.dims4()?;
    if channels != 3 {
        return Err(Error::generation(format!(
            "decoded images have {} channels, expected 3",
            channels
        )));
    }

    let pixels = tensor
        .to_dtype(DType::F32)?
        .affine(127.5, 127.5)?
        .clamp(0f32, 255f32)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((0, 2, 3, 1))?;

    (0..batch)
        .map(|i| {
            let raw = pixels.get(i)?.flatten_all()?.to_vec1::<u8>()?;
            RgbImage::from_raw(width as u32, height as u32, raw)
                .ok_or_else(|| Error::generation("decoded image buffer has the wrong size"))
        })
        .collect()
}
