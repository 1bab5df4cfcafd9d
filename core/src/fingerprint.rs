//! Perceptual fingerprints for near-duplicate photo detection.
//!
//! The photo is shrunk to 16×16 luma, each cell compared with the mean and
//! the resulting 256 bits packed MSB-first into 64 lowercase hex characters.
//! Re-compression, small crops and lighting shifts flip only a few bits.

use std::fmt::Write;

use anyhow::{Context, Result};
use image::DynamicImage;
use image::imageops::FilterType;

const GRID: u32 = 16;

/// Hex characters in a fingerprint.
pub const FINGERPRINT_LEN: usize = (GRID * GRID / 4) as usize;

pub fn fingerprint_bytes(bytes: &[u8]) -> Result<String> {
    let img = image::load_from_memory(bytes).context("Failed to decode image for fingerprinting")?;
    Ok(fingerprint(&img))
}

#[must_use]
pub fn fingerprint(img: &DynamicImage) -> String {
    let cells = img
        .resize_exact(GRID, GRID, FilterType::Triangle)
        .to_luma8()
        .into_raw();
    let mean = cells.iter().map(|&v| u32::from(v)).sum::<u32>() / (GRID * GRID);

    cells
        .chunks(4)
        .map(|nibble| {
            nibble
                .iter()
                .fold(0u8, |acc, &v| (acc << 1) | u8::from(u32::from(v) >= mean))
        })
        .fold(String::with_capacity(FINGERPRINT_LEN), |mut acc, n| {
            let _ = write!(acc, "{n:x}");
            acc
        })
}

/// Number of differing bits, or `None` when the fingerprints are not
/// comparable (different lengths or non-hex input).
#[must_use]
pub fn hamming_distance(a: &str, b: &str) -> Option<u32> {
    if a.len() != b.len() {
        return None;
    }
    a.chars().zip(b.chars()).try_fold(0u32, |acc, (x, y)| {
        let x = x.to_digit(16)?;
        let y = y.to_digit(16)?;
        Some(acc + (x ^ y).count_ones())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let img = GrayImage::from_fn(width, height, |x, _| {
            Luma([u8::try_from(x * 255 / (width - 1)).unwrap()])
        });
        DynamicImage::ImageLuma8(img)
    }

    #[test]
    fn test_fingerprint_shape() {
        let fp = fingerprint(&gradient(64, 48));
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_left_dark_right_bright_packs_msb_first() {
        // Each 16-cell row is 8 dark then 8 bright: 0000 0000 1111 1111 -> "00ff"
        let fp = fingerprint(&gradient(160, 160));
        assert_eq!(&fp[..4], "00ff");
        assert_eq!(fp, "00ff".repeat(16));
    }

    #[test]
    fn test_scaled_copy_is_close() {
        let big = gradient(320, 240);
        let small = big.resize_exact(160, 120, FilterType::Nearest);
        let d = hamming_distance(&fingerprint(&big), &fingerprint(&small)).unwrap();
        assert!(d < 20, "distance {d}");
    }

    #[test]
    fn test_fingerprint_bytes_rejects_garbage() {
        assert!(fingerprint_bytes(b"not an image").is_err());

        let mut png = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, image::Rgb([200, 10, 10])))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        // A flat image is all ones: every cell equals the mean
        assert_eq!(fingerprint_bytes(&png).unwrap(), "f".repeat(FINGERPRINT_LEN));
    }

    #[test]
    fn test_hamming_distance() {
        let a = "0".repeat(FINGERPRINT_LEN);
        let b = format!("f{}", "0".repeat(FINGERPRINT_LEN - 1));
        assert_eq!(hamming_distance(&a, &a), Some(0));
        assert_eq!(hamming_distance(&a, &b), Some(4));
        assert_eq!(hamming_distance(&b, &a), Some(4));
        assert_eq!(hamming_distance("ab", "abc"), None);
        assert_eq!(hamming_distance("zz", "00"), None);
    }
}
