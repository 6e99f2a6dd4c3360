//! Decode, downscale and re-encode artwork.
//!
//! Scaling only ever shrinks: a target larger than the source returns the
//! source dimensions unchanged.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::domain::errors::{CacheError, CacheResult};

/// Default JPEG quality for derived variants.
pub const DEFAULT_LOSSY_QUALITY: u8 = 85;

/// Smallest size stored losslessly by default (the hero tier).
pub const DEFAULT_LOSSLESS_MIN_SIZE: u32 = 800;

/// Bytes per decoded RGBA pixel.
const BYTES_PER_PIXEL: u64 = 4;

/// Encoding used when writing a derived image to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    /// JPEG at the given quality (1-100).
    Lossy(u8),
    /// PNG.
    Lossless,
}

/// Chooses a [`Quality`] per size: lossy below the hero tier, lossless at or above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodePolicy {
    /// JPEG quality for non-hero sizes.
    pub lossy_quality: u8,
    /// Sizes at or above this are stored as PNG.
    pub lossless_min_size: u32,
}

impl EncodePolicy {
    /// Returns the quality to store `size` with.
    #[must_use]
    pub const fn quality_for(&self, size: u32) -> Quality {
        if size >= self.lossless_min_size {
            Quality::Lossless
        } else {
            Quality::Lossy(self.lossy_quality)
        }
    }
}

impl Default for EncodePolicy {
    fn default() -> Self {
        Self {
            lossy_quality: DEFAULT_LOSSY_QUALITY,
            lossless_min_size: DEFAULT_LOSSLESS_MIN_SIZE,
        }
    }
}

/// Decodes encoded image bytes, guessing the format from content.
///
/// # Errors
/// Returns [`CacheError::Decode`] for malformed or unsupported data.
pub fn decode(bytes: &[u8]) -> CacheResult<DynamicImage> {
    if bytes.is_empty() {
        return Err(CacheError::decode("empty image payload"));
    }
    image::load_from_memory(bytes).map_err(|e| CacheError::decode(e.to_string()))
}

/// Encodes `image` with the requested quality.
///
/// # Errors
/// Returns [`CacheError::Decode`] if the encoder rejects the image.
pub fn encode(image: &DynamicImage, quality: Quality) -> CacheResult<Bytes> {
    let mut output = Vec::new();
    match quality {
        Quality::Lossy(q) => {
            let mut encoder = JpegEncoder::new_with_quality(&mut output, q.clamp(1, 100));
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            encoder
                .encode_image(&rgb)
                .map_err(|e| CacheError::decode(format!("JPEG encode failed: {e}")))?;
        }
        Quality::Lossless => {
            image
                .write_to(&mut Cursor::new(&mut output), ImageFormat::Png)
                .map_err(|e| CacheError::decode(format!("PNG encode failed: {e}")))?;
        }
    }
    Ok(Bytes::from(output))
}

/// Length of the longest edge in pixels.
#[must_use]
pub fn longest_edge(image: &DynamicImage) -> u32 {
    let (w, h) = image.dimensions();
    w.max(h)
}

/// Shrinks `image` so its longest edge is `target`, preserving aspect ratio.
///
/// Never enlarges: if the source is already at or below `target` it is
/// returned as-is.
#[must_use]
pub fn downscale(image: &DynamicImage, target: u32) -> DynamicImage {
    if target == 0 || longest_edge(image) <= target {
        return image.clone();
    }
    image.resize(target, target, FilterType::Lanczos3)
}

/// Decoded memory cost of an image at the given device pixel scale.
///
/// Dimensions are logical; each is multiplied by `scale` before the 4 bytes
/// per pixel are applied.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn footprint_bytes(width: u32, height: u32, scale: f32) -> u64 {
    let scale = if scale.is_finite() && scale > 0.0 {
        f64::from(scale)
    } else {
        1.0
    };
    let w = (f64::from(width) * scale).round() as u64;
    let h = (f64::from(height) * scale).round() as u64;
    w * h * BYTES_PER_PIXEL
}
