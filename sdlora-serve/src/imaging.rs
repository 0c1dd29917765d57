//! Input image retrieval, watermarking and JPEG encoding

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage, RgbaImage};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{ServeError, ServeResult};
use crate::fetch::ArtifactLocation;

/// Timeout for fetching a request's input image
pub const INPUT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Box the watermark is thumbnailed into
pub const WATERMARK_SIZE: (u32, u32) = (200, 39);
/// Offset of the watermark from the bottom-right corner
pub const WATERMARK_OFFSET: (u32, u32) = (210, 49);
/// JPEG quality of stored images
pub const JPEG_QUALITY: u8 = 75;

/// Downloads conditioning images.
///
/// The blocking client is built per fetch, so the fetcher can be created
/// inside an async context and used from a blocking worker.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    timeout: Duration,
}

impl Default for ImageFetcher {
    fn default() -> Self {
        Self {
            timeout: INPUT_FETCH_TIMEOUT,
        }
    }
}

impl ImageFetcher {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Fetch `url` as RGB, resized to `width`×`height`
    pub fn fetch(&self, url: &str, width: u32, height: u32) -> ServeResult<RgbImage> {
        let decoded = match ArtifactLocation::parse(url) {
            ArtifactLocation::Http(url) => {
                let client = reqwest::blocking::Client::builder()
                    .timeout(self.timeout)
                    .build()?;
                let bytes = client.get(&url).send()?.error_for_status()?.bytes()?;
                image::load_from_memory(&bytes)?
            }
            ArtifactLocation::Local(path) => image::open(&path)?,
            ArtifactLocation::S3 { .. } => {
                return Err(ServeError::remote_fetch(format!(
                    "input image {} needs an external fetcher",
                    url
                )))
            }
        };
        debug!(
            "Fetched input image {} ({}x{})",
            url,
            decoded.width(),
            decoded.height()
        );
        Ok(fit(decoded, width, height))
    }
}

/// Convert to RGB and resize to exactly `width`×`height`
pub fn fit(image: DynamicImage, width: u32, height: u32) -> RgbImage {
    let rgb = image.to_rgb8();
    if rgb.dimensions() == (width, height) {
        return rgb;
    }
    imageops::resize(&rgb, width, height, FilterType::CatmullRom)
}

/// Overlay composited onto generated images
#[derive(Debug, Clone)]
pub struct Watermark {
    mark: RgbaImage,
}

impl Watermark {
    pub fn load(path: &Path) -> ServeResult<Self> {
        Ok(Self::from_image(image::open(path)?))
    }

    /// Shrink to fit [`WATERMARK_SIZE`], keeping the aspect ratio
    pub fn from_image(image: DynamicImage) -> Self {
        let (max_w, max_h) = WATERMARK_SIZE;
        let image = if image.width() > max_w || image.height() > max_h {
            image.thumbnail(max_w, max_h)
        } else {
            image
        };
        Self {
            mark: image.to_rgba8(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.mark.dimensions()
    }

    /// Paste at `(width - 210, height - 49)`, clipped to the image
    pub fn apply(&self, image: &mut RgbImage) {
        let (width, height) = image.dimensions();
        let x = i64::from(width) - i64::from(WATERMARK_OFFSET.0);
        let y = i64::from(height) - i64::from(WATERMARK_OFFSET.1);

        let mut canvas = DynamicImage::ImageRgb8(image.clone()).to_rgba8();
        imageops::overlay(&mut canvas, &self.mark, x, y);
        *image = DynamicImage::ImageRgba8(canvas).to_rgb8();
    }
}

pub fn encode_jpeg(image: &RgbImage) -> ServeResult<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY).encode_image(image)?;
    Ok(buffer)
}
