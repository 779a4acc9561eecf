use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use png::{BitDepth, ColorType, Encoder};
use serde::{Deserialize, Serialize};

use crate::PageNumber;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

/// Page dimensions in PDF points (or pixels once scaled).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageMetrics {
    pub width: f32,
    pub height: f32,
}

impl PageMetrics {
    pub fn scaled(self, scale: f32) -> Self {
        Self {
            width: self.width * scale,
            height: self.height * scale,
        }
    }

    pub fn aspect_ratio(&self) -> Option<f32> {
        if self.width > 0.0 && self.height > 0.0 {
            Some(self.height / self.width)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// A positioned piece of page text. `y` grows upwards, as in PDF user space.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub font_size: f32,
    pub font_name: Option<String>,
}

pub trait PageAccessor: Send + Sync {
    fn number(&self) -> PageNumber;
    fn metrics(&self) -> PageMetrics;
    fn text_runs(&self) -> Result<Vec<TextRun>>;
    fn rasterize(&self, scale: f32) -> Result<RenderImage>;
}

pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn page(&self, number: PageNumber) -> Result<Arc<dyn PageAccessor>>;
}

#[async_trait::async_trait]
pub trait DocumentOpener: Send + Sync {
    async fn open(&self, bytes: Bytes) -> Result<Arc<dyn DocumentBackend>>;
}

/// PNG-encoded page bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub png: Bytes,
}

impl Raster {
    pub fn encode(image: &RenderImage) -> Result<Self> {
        let mut buffer = Vec::new();
        {
            let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
            encoder.set_color(ColorType::Rgba);
            encoder.set_depth(BitDepth::Eight);
            let mut writer = encoder.write_header()?;
            writer.write_image_data(&image.pixels)?;
            writer.finish()?;
        }
        Ok(Self {
            width: image.width,
            height: image.height,
            png: Bytes::from(buffer),
        })
    }

    pub fn to_data_url(&self) -> String {
        format!("data:image/png;base64,{}", BASE64.encode(&self.png))
    }
}

pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    const MAGIC: &[u8] = b"%PDF-";
    let window = &bytes[..bytes.len().min(1024)];
    window.windows(MAGIC.len()).any(|w| w == MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raster_encodes_png_signature() {
        let image = RenderImage {
            width: 1,
            height: 1,
            pixels: vec![255, 0, 0, 255],
        };
        let raster = Raster::encode(&image).unwrap();
        assert_eq!(&raster.png[..8], b"\x89PNG\r\n\x1a\n");
        assert!(raster.to_data_url().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn pdf_magic_may_follow_leading_garbage() {
        assert!(looks_like_pdf(b"%PDF-1.7\n"));
        assert!(looks_like_pdf(b"\r\n  %PDF-1.4"));
        assert!(!looks_like_pdf(b"<!doctype html><html>"));
        assert!(!looks_like_pdf(b""));
    }
}
