//! Request orchestration: normalize, compose, generate, persist

use sdlora::{
    load_model, DiffusionRuntime, GenerationRequest, LoadOptions, ModelPipeline, RawRequest,
    ServingConfig,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{ServeError, ServeResult};
use crate::fetch::ArtifactFetcher;
use crate::imaging::{encode_jpeg, ImageFetcher, Watermark};
use crate::storage::{ObjectMetadata, ObjectStore, ObjectUri};

/// Content type of stored images
pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

/// Serves generation requests against one loaded model
pub struct Orchestrator {
    config: Arc<ServingConfig>,
    pipeline: ModelPipeline,
    runtime: Arc<dyn DiffusionRuntime>,
    store: Arc<dyn ObjectStore>,
    images: ImageFetcher,
    watermark: Option<Watermark>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ServingConfig>,
        pipeline: ModelPipeline,
        runtime: Arc<dyn DiffusionRuntime>,
        store: Arc<dyn ObjectStore>,
    ) -> ServeResult<Self> {
        let watermark = if config.watermark {
            let path = &config.watermark_image;
            if !path.is_file() {
                return Err(ServeError::config(format!(
                    "watermark is enabled but {} does not exist",
                    path.display()
                )));
            }
            Some(Watermark::load(path)?)
        } else {
            None
        };

        Ok(Self {
            config,
            pipeline,
            runtime,
            store,
            images: ImageFetcher::default(),
            watermark,
        })
    }

    /// Fetch the configured model and adapter, fuse, and build an orchestrator
    #[instrument(skip_all, fields(model = %config.model_name, adapter = ?config.lora_model))]
    pub fn load(
        config: Arc<ServingConfig>,
        runtime: Arc<dyn DiffusionRuntime>,
        store: Arc<dyn ObjectStore>,
    ) -> ServeResult<Self> {
        let fetcher = ArtifactFetcher::new(&config.cache_dir);
        let model_dir = fetcher.fetch(&config.model_name)?;
        let adapter = config
            .lora_model
            .as_deref()
            .map(|id| fetcher.fetch_adapter(id))
            .transpose()?;

        let options = LoadOptions::from_config(&config)?;
        let pipeline = load_model(&model_dir, adapter.as_deref(), &options)?;
        info!("Model ready: {:?}", pipeline);
        Self::new(config, pipeline, runtime, store)
    }

    pub fn config(&self) -> &ServingConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &ModelPipeline {
        &self.pipeline
    }

    /// Generate and store images, returning their URIs
    #[instrument(skip_all)]
    pub fn try_handle(&mut self, raw: RawRequest) -> ServeResult<Vec<String>> {
        let request = GenerationRequest::normalize(raw, &self.config.limits());
        info!(
            "Request: {} steps with {}, {}x{}, count {}, seed {}",
            request.steps(),
            request.sampler(),
            request.width(),
            request.height(),
            request.count(),
            request.seed()
        );

        let init_image = request
            .input_image()
            .map(|url| {
                self.images
                    .fetch(url, request.width() as u32, request.height() as u32)
            })
            .transpose()?;

        let mut images = self.pipeline.compose(&request).generate(
            self.runtime.as_ref(),
            &request,
            init_image.as_ref(),
        )?;

        if let Some(watermark) = &self.watermark {
            for image in &mut images {
                watermark.apply(image);
            }
        }

        let prefix = match request.output_s3uri() {
            Some(uri) => ObjectUri::parse(uri)?,
            None => ObjectUri::parse(&self.config.default_output_uri())?,
        };
        let mut metadata = ObjectMetadata::new();
        metadata
            .insert("prompt", request.prompt())
            .insert("seed", &request.seed().to_string());

        let encoded = images
            .iter()
            .map(encode_jpeg)
            .collect::<ServeResult<Vec<_>>>()?;
        let uris = self.store_all(&prefix, &encoded, &metadata)?;

        info!("Stored {} images under {}", uris.len(), prefix);
        Ok(uris.iter().map(ToString::to_string).collect())
    }

    /// Store every body, or none of them: on failure the objects already
    /// written are deleted before the error is returned
    fn store_all(
        &self,
        prefix: &ObjectUri,
        bodies: &[Vec<u8>],
        metadata: &ObjectMetadata,
    ) -> ServeResult<Vec<ObjectUri>> {
        let mut stored = Vec::with_capacity(bodies.len());
        for body in bodies {
            let uri = prefix.join(&format!("{}.jpg", Uuid::new_v4()));
            if let Err(err) = self.store.put(&uri, body, IMAGE_CONTENT_TYPE, metadata) {
                warn!("Storing {} failed, removing {} stored images", uri, stored.len());
                for done in &stored {
                    if let Err(cleanup) = self.store.delete(done) {
                        error!("Could not remove {}: {}", done, cleanup);
                    }
                }
                return Err(err);
            }
            stored.push(uri);
        }
        Ok(stored)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", &self.pipeline)
            .field("watermark", &self.watermark.is_some())
            .finish()
    }
}
