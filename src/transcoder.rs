use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, ImageBuffer, ImageFormat, Rgb, RgbImage};

use crate::errors::Result;
use crate::overlay;

/// JPEG encoding/decoding for frames moving between sources, sessions and
/// viewers.
#[derive(Debug, Clone, Copy)]
pub struct FrameTranscoder {
    quality: u8,
}

impl FrameTranscoder {
    pub fn new(quality: u8) -> Self {
        Self { quality: quality.clamp(1, 100) }
    }

    #[cfg(test)]
    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode_rgb(&self, frame: &RgbImage) -> Result<Bytes> {
        let mut jpeg_data = Vec::with_capacity(64 * 1024);
        JpegEncoder::new_with_quality(&mut jpeg_data, self.quality).encode_image(frame)?;
        Ok(Bytes::from(jpeg_data))
    }

    pub fn encode_gray(&self, frame: &GrayImage) -> Result<Bytes> {
        let mut jpeg_data = Vec::with_capacity(32 * 1024);
        JpegEncoder::new_with_quality(&mut jpeg_data, self.quality).encode_image(frame)?;
        Ok(Bytes::from(jpeg_data))
    }

    pub fn decode(jpeg_data: &[u8]) -> Result<RgbImage> {
        let img = image::load_from_memory_with_format(jpeg_data, ImageFormat::Jpeg)?;
        Ok(img.to_rgb8())
    }

    /// Frame served to viewers while a camera has not produced anything yet.
    pub fn placeholder(&self, width: u32, height: u32, message: &str) -> Result<Bytes> {
        let mut img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            // Dark diagonal gradient so the placeholder is obviously not a camera picture
            let shade = (((x + y) * 64) / (width + height).max(1)) as u8;
            Rgb([24 + shade, 24 + shade, 32 + shade])
        });

        let text_y = height / 2;
        overlay::draw_text(&mut img, 10, text_y.saturating_sub(8), message, 2, overlay::TEXT_COLOR);

        self.encode_rgb(&img)
    }
}
