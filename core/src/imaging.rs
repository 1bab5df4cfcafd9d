//! Photo preparation before any provider call.
//!
//! Steps: decode → bound the longest edge → luma percentile contrast stretch
//! → JPEG re-encode → base64.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use crate::settings::AnalysisSettings;

/// A prepared photo, ready to attach to a provider request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub media_type: String,
    pub data_base64: String,
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    #[must_use]
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data_base64)
    }
}

/// Remove a `data:image/...;base64,` prefix if present.
#[must_use]
pub fn strip_data_url(input: &str) -> &str {
    let trimmed = input.trim();
    if trimmed.starts_with("data:") {
        if let Some(idx) = trimmed.find(";base64,") {
            return &trimmed[idx + ";base64,".len()..];
        }
    }
    trimmed
}

/// Decode base64 (optionally wrapped in a data URL) into raw image bytes.
pub fn decode_base64_image(input: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(strip_data_url(input))
        .context("Image is not valid base64")
}

pub fn prepare_image(bytes: &[u8], settings: &AnalysisSettings) -> Result<EncodedImage> {
    let img = image::load_from_memory(bytes).context("Failed to decode image")?;
    let img = bound_longest_edge(img, settings.max_image_edge);
    let rgb = stretch_contrast(
        img.to_rgb8(),
        settings.contrast_low_percentile,
        settings.contrast_high_percentile,
    );
    let (width, height) = rgb.dimensions();

    let mut jpeg = Vec::new();
    DynamicImage::ImageRgb8(rgb)
        .write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, settings.jpeg_quality))
        .context("Failed to encode JPEG")?;

    Ok(EncodedImage {
        media_type: "image/jpeg".to_string(),
        data_base64: STANDARD.encode(&jpeg),
        width,
        height,
    })
}

fn bound_longest_edge(img: DynamicImage, max_edge: u32) -> DynamicImage {
    if max_edge == 0 || img.width().max(img.height()) <= max_edge {
        return img;
    }
    img.resize(max_edge, max_edge, FilterType::Lanczos3)
}

/// Linear stretch mapping the `low`/`high` luma percentiles to 0/255.
/// Flat images (no spread between the percentiles) are returned unchanged.
fn stretch_contrast(mut rgb: RgbImage, low: f64, high: f64) -> RgbImage {
    let luma = DynamicImage::ImageRgb8(rgb.clone()).to_luma8();
    let mut histogram = [0u64; 256];
    for &v in luma.as_raw() {
        histogram[usize::from(v)] += 1;
    }
    let total: u64 = histogram.iter().sum();
    let (Some(lo), Some(hi)) = (
        percentile(&histogram, total, low),
        percentile(&histogram, total, high),
    ) else {
        return rgb;
    };
    if hi <= lo {
        return rgb;
    }

    let span = f64::from(hi - lo);
    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        let scaled = (v as f64 - f64::from(lo)) * 255.0 / span;
        #[allow(clippy::cast_sign_loss)]
        {
            *slot = scaled.round().clamp(0.0, 255.0) as u8;
        }
    }
    for px in rgb.pixels_mut() {
        for c in &mut px.0 {
            *c = lut[usize::from(*c)];
        }
    }
    rgb
}

fn percentile(histogram: &[u64; 256], total: u64, fraction: f64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
    let target = ((total as f64) * fraction.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
    let mut seen = 0;
    for (value, count) in histogram.iter().enumerate() {
        seen += count;
        if seen >= target {
            return u8::try_from(value).ok();
        }
    }
    Some(u8::MAX)
}
