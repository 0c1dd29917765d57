//! Configuration structures for the serving process
//!
//! Configuration is read once at process start, validated, and then passed
//! around by reference. Sources are layered with the `config` crate:
//! built-in defaults, an optional file, then `SDLORA_*` environment variables.

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Prefix of the environment variables overriding configuration values
pub const ENV_PREFIX: &str = "SDLORA";

/// Lower bound of the `steps` request field
pub const MIN_STEPS: usize = 20;
/// Lower bound of the `height` and `width` request fields
pub const MIN_SIDE: usize = 64;
/// Lower bound of the `count` request field
pub const MIN_COUNT: usize = 1;

/// Process-wide serving configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServingConfig {
    /// Base model identifier (local path, `file://` or `http(s)://` URI)
    pub model_name: String,
    /// Optional LoRA adapter identifier (`.safetensors` file or URI)
    pub lora_model: Option<String>,
    /// Blend strength applied to every fused adapter delta
    pub lora_multiplier: f64,
    /// Numeric precision the model weights are held in
    pub precision: Precision,
    /// Compute device
    pub device: DeviceType,
    /// Upper bound for `steps`
    pub max_steps: usize,
    /// Upper bound for `height`
    pub max_height: usize,
    /// Upper bound for `width`
    pub max_width: usize,
    /// Upper bound for `count`
    pub max_count: usize,
    /// Bucket used when a request carries no output location
    pub s3_bucket: String,
    /// Key prefix used when a request carries no output location
    pub output_prefix: String,
    /// Composite the watermark asset onto every image
    pub watermark: bool,
    /// Watermark asset path
    pub watermark_image: PathBuf,
    /// Screen generated images with the runtime's safety checker
    pub safety_checker_enable: bool,
    /// Surface generation failures as errors instead of empty results
    pub strict_errors: bool,
    /// Directory remote artifacts are downloaded and extracted into
    pub cache_dir: PathBuf,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            model_name: "stabilityai/stable-diffusion-2".to_string(),
            lora_model: None,
            lora_multiplier: 0.5,
            precision: Precision::F32,
            device: DeviceType::Cpu,
            max_steps: 100,
            max_height: 768,
            max_width: 768,
            max_count: 4,
            s3_bucket: "sdlora-outputs".to_string(),
            output_prefix: "stablediffusion/asyncinvoke/images/".to_string(),
            watermark: false,
            watermark_image: PathBuf::from("sagemaker-logo-small.png"),
            safety_checker_enable: false,
            strict_errors: false,
            cache_dir: std::env::temp_dir().join("sdlora"),
        }
    }
}

impl ServingConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Same as [`ServingConfig::load`] with a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default()).map_err(config_error)?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let config: Self = builder
            .add_source(config::Environment::with_prefix(env_prefix).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(Error::config("model_name must not be empty"));
        }

        if !self.lora_multiplier.is_finite() {
            return Err(Error::config("lora_multiplier must be a finite number"));
        }

        if self.max_steps < MIN_STEPS {
            return Err(Error::config(format!(
                "max_steps must be at least {}",
                MIN_STEPS
            )));
        }

        if self.max_height < MIN_SIDE || self.max_width < MIN_SIDE {
            return Err(Error::config(format!(
                "max_height and max_width must be at least {}",
                MIN_SIDE
            )));
        }

        if self.max_count < MIN_COUNT {
            return Err(Error::config("max_count must be at least 1"));
        }

        if self.s3_bucket.trim().is_empty() {
            return Err(Error::config("s3_bucket must not be empty"));
        }

        Ok(())
    }

    /// Resource envelope for incoming requests
    pub fn limits(&self) -> RequestLimits {
        RequestLimits {
            steps: Bounds::new(MIN_STEPS, self.max_steps),
            height: Bounds::new(MIN_SIDE, self.max_height),
            width: Bounds::new(MIN_SIDE, self.max_width),
            count: Bounds::new(MIN_COUNT, self.max_count),
        }
    }

    /// Output location used when a request does not name one
    pub fn default_output_uri(&self) -> String {
        format!("s3://{}/{}", self.s3_bucket, self.output_prefix)
    }
}

fn config_error(err: config::ConfigError) -> Error {
    Error::config(err.to_string())
}

/// Inclusive bounds of a clamped request field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    /// Smallest accepted value
    pub min: usize,
    /// Largest accepted value
    pub max: usize,
}

impl Bounds {
    /// Create bounds; `max` is raised to `min` if it is smaller
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Saturating clamp of an untrusted value
    pub fn clamp(&self, value: i64) -> usize {
        if value <= self.min as i64 {
            self.min
        } else if value >= self.max as i64 {
            self.max
        } else {
            value as usize
        }
    }
}

/// Bounds for every resource-affecting request field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    /// Denoising steps
    pub steps: Bounds,
    /// Image height in pixels
    pub height: Bounds,
    /// Image width in pixels
    pub width: Bounds,
    /// Images per request
    pub count: Bounds,
}

impl Default for RequestLimits {
    fn default() -> Self {
        ServingConfig::default().limits()
    }
}

/// Numeric precision of model weights
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit float
    F32,
    /// 16-bit float
    F16,
    /// bfloat16
    Bf16,
}

impl Precision {
    /// Matching candle dtype
    pub fn dtype(&self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

/// Device types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// CPU device
    Cpu,
    /// First CUDA GPU
    Cuda,
    /// Metal (Apple Silicon)
    Metal,
}

impl DeviceType {
    /// Instantiate the candle device
    pub fn device(&self) -> Result<Device> {
        Ok(match self {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda => Device::new_cuda(0)?,
            DeviceType::Metal => Device::new_metal(0)?,
        })
    }
}
