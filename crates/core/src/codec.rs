//! Image bytes in, image bytes out.

use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ImageReader, RgbImage};
use serde::{Deserialize, Serialize};

use crate::config::LimitsConfig;
use crate::error::UpscaleError;
use crate::preprocess;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
}

impl OutputFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }

    /// Pick a format from a file extension; anything but jpg/jpeg is PNG.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Self::Jpeg,
            _ => Self::Png,
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Decode raw upload bytes, sniffing the container from magic bytes.
///
/// The dimensions declared in the header are checked against `limits` before
/// any pixel data is allocated.
pub fn decode_image(bytes: &[u8], limits: &LimitsConfig) -> Result<DynamicImage, UpscaleError> {
    if bytes.is_empty() {
        return Err(UpscaleError::Decode("image data is empty".into()));
    }
    let format = image::guess_format(bytes)
        .map_err(|_| UpscaleError::Decode("unsupported image format".into()))?;
    let dimensions = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(|e| UpscaleError::Decode(e.to_string()))?;
    preprocess::check_input_size(dimensions, limits)?;
    ImageReader::with_format(Cursor::new(bytes), format)
        .decode()
        .map_err(|e| UpscaleError::Decode(e.to_string()))
}

/// Decode a base64 payload, tolerating a `data:image/...;base64,` prefix and
/// embedded whitespace.
pub fn decode_base64_image(
    payload: &str,
    limits: &LimitsConfig,
) -> Result<DynamicImage, UpscaleError> {
    let body = match payload.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => payload,
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(UpscaleError::Validation("image payload is empty".into()));
    }
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| UpscaleError::Validation(format!("Invalid base64 encoding: {e}")))?;
    decode_image(&bytes, limits)
}

pub fn encode_image(image: &RgbImage, format: OutputFormat, jpeg_quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        OutputFormat::Png => image.write_with_encoder(PngEncoder::new(&mut buf)),
        OutputFormat::Jpeg => {
            image.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, jpeg_quality))
        }
    }
    .with_context(|| format!("Failed to encode {}x{} image as {format}", image.width(), image.height()))?;
    Ok(buf.into_inner())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
