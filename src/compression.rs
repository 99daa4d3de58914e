//! Turns a snapshotted RGB pixel region into compressed image bytes.
//!
//! This module has no RFB-protocol knowledge: it is a thin wrapper over the
//! `image` crate, callable from a blocking-friendly context. The broadcaster
//! dispatches the JPEG path to `spawn_blocking` for large bounding boxes.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};

use crate::error::{GatewayError, Result};

/// Encodes `pixels` (row-major RGB, `width * height * 3` bytes) as a JPEG at
/// the given quality (1-100).
pub fn encode_jpeg(pixels: &[u8], width: u16, height: u16, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .write_image(pixels, u32::from(width), u32::from(height), ColorType::Rgb8)
        .map_err(|err| GatewayError::Encoding(err.to_string()))?;
    Ok(out)
}

/// Encodes `pixels` (row-major RGB, `width * height * 3` bytes) as a PNG.
pub fn encode_png(pixels: &[u8], width: u16, height: u16) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    let encoder = PngEncoder::new(&mut out);
    encoder
        .write_image(pixels, u32::from(width), u32::from(height), ColorType::Rgb8)
        .map_err(|err| GatewayError::Encoding(err.to_string()))?;
    Ok(out.into_inner())
}

/// Quality selection from ยง4.5: 65 for boxes covering more than 20% of the
/// framebuffer area, 85 otherwise.
#[must_use]
pub fn quality_for_area(bbox_area: u32, framebuffer_area: u32) -> u8 {
    if framebuffer_area == 0 {
        return 85;
    }
    if f64::from(bbox_area) / f64::from(framebuffer_area) > 0.2 {
        65
    } else {
        85
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_round_trips_through_the_image_crate() {
        let pixels = vec![255u8, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 0];
        let bytes = encode_jpeg(&pixels, 2, 2, 85).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(&bytes[0..2], &[0xFF, 0xD8]); // JPEG SOI marker
    }

    #[test]
    fn png_has_signature() {
        let pixels = vec![1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let bytes = encode_png(&pixels, 2, 2).unwrap();
        assert_eq!(&bytes[0..8], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[test]
    fn quality_drops_for_large_bounding_boxes() {
        assert_eq!(quality_for_area(25, 100), 65); // 25%
        assert_eq!(quality_for_area(20, 100), 85); // exactly 20%, not >20%
        assert_eq!(quality_for_area(5, 100), 85);
    }
}
