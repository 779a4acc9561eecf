//! Cover preview downsampling for persisted reading sessions.

use std::io::Cursor;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

#[derive(Debug, Clone, Copy)]
pub struct PreviewSpec {
    pub max_width: u32,
    pub max_height: u32,
    pub quality: u8,
}

impl Default for PreviewSpec {
    fn default() -> Self {
        Self {
            max_width: 300,
            max_height: 400,
            quality: 70,
        }
    }
}

/// Landscape images are bounded by width, everything else by height.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    let (w, h) = (width as f64, height as f64);
    let (w, h) = if width > height {
        if width > max_width {
            (max_width as f64, h * max_width as f64 / w)
        } else {
            (w, h)
        }
    } else if height > max_height {
        (w * max_height as f64 / h, max_height as f64)
    } else {
        (w, h)
    };
    ((w as u32).max(1), (h as u32).max(1))
}

/// Decodes an encoded page image and returns a JPEG data URL that fits the
/// preview bounds.
pub fn compress_preview(encoded: &[u8], spec: PreviewSpec) -> Result<String> {
    let decoded = image::load_from_memory(encoded).context("failed to decode page image")?;
    let (width, height) = fit_within(
        decoded.width(),
        decoded.height(),
        spec.max_width,
        spec.max_height,
    );
    let rgb = decoded
        .resize_exact(width, height, FilterType::Triangle)
        .to_rgb8();

    let mut buffer = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, spec.quality);
    encoder
        .encode_image(&rgb)
        .context("failed to encode preview")?;

    Ok(format!(
        "data:image/jpeg;base64,{}",
        BASE64.encode(buffer.into_inner())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Raster, RenderImage};

    #[test]
    fn portrait_pages_are_bounded_by_height() {
        assert_eq!(fit_within(918, 1188, 300, 400), (309, 400));
        assert_eq!(fit_within(200, 300, 300, 400), (200, 300));
    }

    #[test]
    fn landscape_pages_are_bounded_by_width() {
        assert_eq!(fit_within(1200, 600, 300, 400), (300, 150));
        assert_eq!(fit_within(250, 100, 300, 400), (250, 100));
    }

    #[test]
    fn square_images_use_the_height_bound() {
        assert_eq!(fit_within(800, 800, 300, 400), (400, 400));
    }

    #[test]
    fn compresses_png_into_jpeg_data_url() {
        let image = RenderImage {
            width: 40,
            height: 60,
            pixels: vec![200; 40 * 60 * 4],
        };
        let raster = Raster::encode(&image).unwrap();
        let url = compress_preview(&raster.png, PreviewSpec::default()).unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn undecodable_input_is_an_error() {
        assert!(compress_preview(b"not an image", PreviewSpec::default()).is_err());
    }
}
