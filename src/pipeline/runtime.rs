//! Neural network runtime boundary
//!
//! The crate owns weights, fusion, scheduling and the sampling loop; the
//! forward passes of the text encoder, denoising network and VAE are supplied
//! by an implementation of [`DiffusionRuntime`].

use candle_core::Tensor;
use image::RgbImage;

use crate::error::Result;
use crate::model::SubModel;

/// Forward passes of the three sub-models
///
/// All tensors handed to the runtime live on the device of the loaded
/// weights. Latents are `f32`; an implementation running in reduced precision
/// converts on the way in and out.
pub trait DiffusionRuntime: Send + Sync {
    /// Encode one prompt into conditioning embeddings, shape `(1, seq, dim)`
    fn encode_prompt(&self, text_encoder: &SubModel, prompt: &str) -> Result<Tensor>;

    /// Predict noise (or velocity) for a batch of scaled latents at `timestep`
    fn predict_noise(
        &self,
        unet: &SubModel,
        latents: &Tensor,
        timestep: f64,
        conditioning: &Tensor,
    ) -> Result<Tensor>;

    /// Encode images in `[-1, 1]`, shape `(1, 3, H, W)`, into unscaled latents
    fn encode_image(&self, vae: &SubModel, image: &Tensor) -> Result<Tensor>;

    /// Decode unscaled latents into images in `[-1, 1]`, shape `(B, 3, H, W)`
    fn decode_latents(&self, vae: &SubModel, latents: &Tensor) -> Result<Tensor>;

    /// Channels of the latent space
    fn latent_channels(&self) -> usize {
        4
    }

    /// Safety screen; only called when the safety checker is enabled
    fn is_unsafe(&self, _image: &RgbImage) -> Result<bool> {
        Ok(false)
    }
}
