//! Raster transcoding.
//!
//! Converts a rendered PNG into the compact lossy format that gets uploaded,
//! and into a base64 copy for inline transport. Transparency is flattened
//! onto white before encoding since the target format carries
//! no alpha channel.

use crate::{
    error::TranscodeError,
    types::{CompactFormat, CompactImage, RasterImage},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{RgbImage, RgbaImage, codecs::jpeg::JpegEncoder};
use std::fs;

pub const DEFAULT_QUALITY: u8 = 40;
const WHITE: [u8; 3] = [255, 255, 255];

/// Converts rasters to [`CompactImage`]s at a fixed quality.
#[derive(Debug, Clone, Copy)]
pub struct Transcoder {
    quality: u8,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY)
    }
}

impl Transcoder {
    /// `quality` is clamped to the JPEG range `1..=100`.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub const fn quality(&self) -> u8 {
        self.quality
    }

    /// Reads the raster from disk, flattens it and writes the compact image
    /// beside it with the target extension.
    ///
    /// # Errors
    ///
    /// [`TranscodeError::Unreadable`] if the raster is missing or corrupt.
    pub fn to_compact(&self, raster: &RasterImage) -> Result<CompactImage, TranscodeError> {
        let decoded = image::open(&raster.path).map_err(|source| TranscodeError::Unreadable {
            path: raster.path.display().to_string(),
            source,
        })?;

        let flat = flatten(&decoded.to_rgba8(), WHITE);

        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, self.quality)
            .encode_image(&flat)
            .map_err(TranscodeError::Encode)?;

        let format = CompactFormat::Jpeg;
        let path = raster.path.with_extension(format.extension());
        fs::write(&path, &bytes)?;

        Ok(CompactImage {
            path,
            kind: raster.kind,
            format,
            bytes,
        })
    }

    /// Base64 (standard alphabet, padded) copy of the compact image.
    pub fn to_encoded_text(&self, image: &CompactImage) -> String {
        STANDARD.encode(&image.bytes)
    }
}

/// Alpha-composites every pixel over `background`.
fn flatten(source: &RgbaImage, background: [u8; 3]) -> RgbImage {
    RgbImage::from_fn(source.width(), source.height(), |x, y| {
        let [r, g, b, a] = source.get_pixel(x, y).0;
        let alpha = u16::from(a);
        let blend = |c: u8, bg: u8| {
            ((u16::from(c) * alpha + u16::from(bg) * (255 - alpha) + 127) / 255) as u8
        };
        image::Rgb([
            blend(r, background[0]),
            blend(g, background[1]),
            blend(b, background[2]),
        ])
    })
}
