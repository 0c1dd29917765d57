//! Request normalization
//!
//! Untrusted request bodies deserialize into [`RawRequest`]; the only way to
//! obtain a [`GenerationRequest`] is [`GenerationRequest::normalize`], which
//! fills defaults and clamps every resource-affecting field into the
//! configured [`RequestLimits`]. Out-of-range values and unknown samplers are
//! substituted rather than rejected. Numeric fields accept any JSON number:
//! fractions truncate and out-of-range magnitudes saturate.

use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use crate::config::{Bounds, RequestLimits};
use crate::pipeline::scheduler::{sampler_or_default, SamplerKind};

/// Prompt used when a request does not carry one
pub const DEFAULT_PROMPT: &str = "a photo of an astronaut riding a horse on mars";
/// Default denoising steps
pub const DEFAULT_STEPS: i64 = 20;
/// Default image height and width
pub const DEFAULT_SIDE: i64 = 512;
/// Default number of images
pub const DEFAULT_COUNT: i64 = 1;
/// Default seed
pub const DEFAULT_SEED: u64 = 1024;

/// Image sides are multiples of this
const SIDE_ALIGNMENT: usize = 8;

/// Request body as sent by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRequest {
    /// Text prompt
    pub prompt: Option<String>,
    /// Negative prompt
    pub negative_prompt: Option<String>,
    /// Denoising steps
    #[serde(deserialize_with = "lenient_integer")]
    pub steps: Option<i64>,
    /// Sampler name
    pub sampler: Option<String>,
    /// Seed; negative values ask for a random seed
    #[serde(deserialize_with = "lenient_integer")]
    pub seed: Option<i64>,
    /// Image height
    #[serde(deserialize_with = "lenient_integer")]
    pub height: Option<i64>,
    /// Image width
    #[serde(deserialize_with = "lenient_integer")]
    pub width: Option<i64>,
    /// Number of images
    #[serde(deserialize_with = "lenient_integer")]
    pub count: Option<i64>,
    /// URL of the conditioning image
    pub input_image: Option<String>,
    /// Output location, `s3://bucket/prefix/`
    pub output_s3uri: Option<String>,
}

/// A validated request; immutable once built
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    prompt: String,
    negative_prompt: String,
    steps: usize,
    sampler: SamplerKind,
    height: usize,
    width: usize,
    count: usize,
    seed: u64,
    input_image: Option<String>,
    output_s3uri: Option<String>,
}

impl GenerationRequest {
    /// Fill defaults and clamp every bounded field into `limits`
    pub fn normalize(raw: RawRequest, limits: &RequestLimits) -> Self {
        let steps = clamp_field("steps", raw.steps.unwrap_or(DEFAULT_STEPS), limits.steps);
        let height = align_side(clamp_field(
            "height",
            raw.height.unwrap_or(DEFAULT_SIDE),
            limits.height,
        ));
        let width = align_side(clamp_field(
            "width",
            raw.width.unwrap_or(DEFAULT_SIDE),
            limits.width,
        ));
        let count = clamp_field("count", raw.count.unwrap_or(DEFAULT_COUNT), limits.count);

        let seed = match raw.seed {
            None => DEFAULT_SEED,
            Some(seed) if seed >= 0 => seed as u64,
            Some(seed) => {
                let random = u64::from(rand::random::<u32>());
                info!("Seed {} requested a random seed, using {}", seed, random);
                random
            }
        };

        Self {
            prompt: raw.prompt.unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            negative_prompt: raw.negative_prompt.unwrap_or_default(),
            steps,
            sampler: sampler_or_default(raw.sampler.as_deref()),
            height,
            width,
            count,
            seed,
            input_image: non_blank(raw.input_image),
            output_s3uri: non_blank(raw.output_s3uri),
        }
    }

    /// Text prompt
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Negative prompt, possibly empty
    pub fn negative_prompt(&self) -> &str {
        &self.negative_prompt
    }

    /// Denoising steps
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Sampling algorithm
    pub fn sampler(&self) -> SamplerKind {
        self.sampler
    }

    /// Image height in pixels, a multiple of 8
    pub fn height(&self) -> usize {
        self.height
    }

    /// Image width in pixels, a multiple of 8
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of images
    pub fn count(&self) -> usize {
        self.count
    }

    /// Noise seed
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// URL of the conditioning image
    pub fn input_image(&self) -> Option<&str> {
        self.input_image.as_deref()
    }

    /// Requested output location
    pub fn output_s3uri(&self) -> Option<&str> {
        self.output_s3uri.as_deref()
    }
}

/// Any JSON number as an `i64`, saturating at the type's bounds
fn lenient_integer<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let number = Option::<serde_json::Number>::deserialize(deserializer)?;
    Ok(number.map(|n| {
        if let Some(v) = n.as_i64() {
            v
        } else if n.as_u64().is_some() {
            i64::MAX
        } else {
            // `as` saturates and maps NaN to 0
            n.as_f64().map_or(0, |v| v as i64)
        }
    }))
}

fn clamp_field(field: &str, value: i64, bounds: Bounds) -> usize {
    let clamped = bounds.clamp(value);
    if clamped as i64 != value {
        info!(
            "Clamped {} from {} to {} (bounds [{}, {}])",
            field, value, clamped, bounds.min, bounds.max
        );
    }
    clamped
}

fn align_side(side: usize) -> usize {
    (side / SIDE_ALIGNMENT * SIDE_ALIGNMENT).max(SIDE_ALIGNMENT)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
