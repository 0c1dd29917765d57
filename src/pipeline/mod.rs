//! Pipeline composition
//!
//! [`ModelPipeline`] holds the fused, frozen sub-models behind `Arc`s plus the
//! installed scheduler. For every request it is composed into a short-lived
//! [`ComposedPipeline`]: the text-to-image or image-to-image variant, both
//! sharing the same sub-model instances, with the scheduler the request asked
//! for.

pub mod runtime;
pub mod sampling;
pub mod scheduler;

use image::RgbImage;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::model::{ModelWeights, SubModel};
use crate::request::GenerationRequest;
use runtime::DiffusionRuntime;
use scheduler::{SamplerKind, Scheduler, SchedulerConfig};

/// Shared, read-only sub-models
#[derive(Debug, Clone)]
pub struct Components {
    /// Prompt encoder
    pub text_encoder: Arc<SubModel>,
    /// Denoising network
    pub unet: Arc<SubModel>,
    /// Image encoder/decoder
    pub vae: Arc<SubModel>,
}

impl Components {
    /// Freeze owned weights into shared components
    pub fn from_weights(weights: ModelWeights) -> Self {
        Self {
            text_encoder: Arc::new(weights.text_encoder),
            unet: Arc::new(weights.unet),
            vae: Arc::new(weights.vae),
        }
    }

    /// Whether both sets point at the very same sub-model instances
    pub fn shares_with(&self, other: &Components) -> bool {
        Arc::ptr_eq(&self.text_encoder, &other.text_encoder)
            && Arc::ptr_eq(&self.unet, &other.unet)
            && Arc::ptr_eq(&self.vae, &other.vae)
    }
}

/// Generation mode of a composed pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Prompt-only generation
    TextToImage,
    /// Generation conditioned on an input image
    ImageToImage,
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMode::TextToImage => f.write_str("text-to-image"),
            PipelineMode::ImageToImage => f.write_str("image-to-image"),
        }
    }
}

/// The loaded model, ready to serve
pub struct ModelPipeline {
    components: Components,
    scheduler: Box<dyn Scheduler>,
    safety_checker: bool,
}

impl ModelPipeline {
    /// Freeze fused weights and install the default scheduler.
    ///
    /// Fails with [`Error::Config`] when the schedule configuration is invalid.
    pub fn new(weights: ModelWeights, scheduler_config: SchedulerConfig) -> Result<Self> {
        scheduler_config.validate()?;
        Ok(Self {
            components: Components::from_weights(weights),
            scheduler: SamplerKind::default().build(&scheduler_config),
            safety_checker: false,
        })
    }

    /// Enable or disable the runtime's safety screen
    pub fn with_safety_checker(mut self, enabled: bool) -> Self {
        self.safety_checker = enabled;
        self
    }

    /// Shared sub-models
    pub fn components(&self) -> &Components {
        &self.components
    }

    /// Currently installed scheduler
    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    /// Replace the installed scheduler, keeping its schedule configuration
    pub fn install_scheduler(&mut self, kind: SamplerKind) {
        // set_timesteps resets all sampling state, so the same kind is reused
        if self.scheduler.kind() != kind {
            let config = self.scheduler.config().clone();
            debug!("Swapping scheduler {} -> {}", self.scheduler.kind(), kind);
            self.scheduler = kind.build(&config);
        }
    }

    /// Compose the variant a request needs and install its scheduler
    pub fn compose(&mut self, request: &GenerationRequest) -> ComposedPipeline<'_> {
        self.install_scheduler(request.sampler());
        let base = PipelineParts {
            components: self.components.clone(),
            scheduler: &mut *self.scheduler,
            safety_checker: self.safety_checker,
        };

        if request.input_image().is_some() {
            ComposedPipeline::ImageToImage(ImageToImagePipeline { parts: base })
        } else {
            ComposedPipeline::TextToImage(TextToImagePipeline { parts: base })
        }
    }
}

impl fmt::Debug for ModelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPipeline")
            .field("components", &self.components)
            .field("scheduler", &self.scheduler.kind())
            .field("safety_checker", &self.safety_checker)
            .finish()
    }
}

struct PipelineParts<'a> {
    components: Components,
    scheduler: &'a mut dyn Scheduler,
    safety_checker: bool,
}

/// Prompt-only generation
pub struct TextToImagePipeline<'a> {
    parts: PipelineParts<'a>,
}

impl TextToImagePipeline<'_> {
    /// Generate `request.count()` images
    pub fn generate(
        &mut self,
        runtime: &dyn DiffusionRuntime,
        request: &GenerationRequest,
    ) -> Result<Vec<RgbImage>> {
        let parts = &mut self.parts;
        sampling::run(
            runtime,
            &parts.components,
            &mut *parts.scheduler,
            request,
            None,
            parts.safety_checker,
        )
    }
}

/// Generation starting from an input image
pub struct ImageToImagePipeline<'a> {
    parts: PipelineParts<'a>,
}

impl ImageToImagePipeline<'_> {
    /// Generate `request.count()` images from `init_image`, which must already
    /// have the request's width and height
    pub fn generate(
        &mut self,
        runtime: &dyn DiffusionRuntime,
        request: &GenerationRequest,
        init_image: &RgbImage,
    ) -> Result<Vec<RgbImage>> {
        if init_image.width() as usize != request.width()
            || init_image.height() as usize != request.height()
        {
            return Err(Error::invalid_input(format!(
                "input image is {}x{}, request is {}x{}",
                init_image.width(),
                init_image.height(),
                request.width(),
                request.height()
            )));
        }
        let parts = &mut self.parts;
        sampling::run(
            runtime,
            &parts.components,
            &mut *parts.scheduler,
            request,
            Some(init_image),
            parts.safety_checker,
        )
    }
}

/// A per-request pipeline variant
pub enum ComposedPipeline<'a> {
    /// No input image
    TextToImage(TextToImagePipeline<'a>),
    /// With input image
    ImageToImage(ImageToImagePipeline<'a>),
}

impl ComposedPipeline<'_> {
    /// Which variant this is
    pub fn mode(&self) -> PipelineMode {
        match self {
            ComposedPipeline::TextToImage(_) => PipelineMode::TextToImage,
            ComposedPipeline::ImageToImage(_) => PipelineMode::ImageToImage,
        }
    }

    /// Sub-models used by this variant
    pub fn components(&self) -> &Components {
        match self {
            ComposedPipeline::TextToImage(p) => &p.parts.components,
            ComposedPipeline::ImageToImage(p) => &p.parts.components,
        }
    }

    /// Sampler installed for this request
    pub fn sampler(&self) -> SamplerKind {
        match self {
            ComposedPipeline::TextToImage(p) => p.parts.scheduler.kind(),
            ComposedPipeline::ImageToImage(p) => p.parts.scheduler.kind(),
        }
    }

    /// Generate images; image-to-image requires `init_image`
    #[instrument(skip_all, fields(mode = %self.mode(), sampler = %self.sampler(), steps = request.steps(), count = request.count()))]
    pub fn generate(
        &mut self,
        runtime: &dyn DiffusionRuntime,
        request: &GenerationRequest,
        init_image: Option<&RgbImage>,
    ) -> Result<Vec<RgbImage>> {
        let images = match (self, init_image) {
            (ComposedPipeline::TextToImage(p), _) => p.generate(runtime, request)?,
            (ComposedPipeline::ImageToImage(p), Some(image)) => {
                p.generate(runtime, request, image)?
            }
            (ComposedPipeline::ImageToImage(_), None) => {
                return Err(Error::invalid_input(
                    "image-to-image generation needs an input image",
                ))
            }
        };
        info!("Generated {} images", images.len());
        Ok(images)
    }
}
