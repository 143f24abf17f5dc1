//! In-process stand-ins for the ONNX loader, shared by unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use image::{imageops::FilterType, RgbImage};

use crate::error::UpscaleError;
use crate::inference::{ModelLoader, UpscaleModel};
use crate::model_registry::ModelDescriptor;

/// Loader that counts construction attempts and never touches the filesystem.
#[derive(Default)]
pub struct CountingLoader {
    loads: AtomicUsize,
    upscales: Arc<AtomicUsize>,
    delay: Option<Duration>,
    fail: bool,
    output_factor: Option<u32>,
}

impl CountingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside `load`, widening the race window for concurrency tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Make models return `factor`× output instead of their native scale.
    pub fn with_output_factor(mut self, factor: u32) -> Self {
        self.output_factor = Some(factor);
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Total `upscale` calls across every model this loader produced.
    pub fn upscales(&self) -> usize {
        self.upscales.load(Ordering::SeqCst)
    }
}

impl ModelLoader for CountingLoader {
    fn load(
        &self,
        descriptor: &ModelDescriptor,
        _model_path: &Path,
    ) -> Result<Arc<dyn UpscaleModel>, UpscaleError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.fail {
            return Err(UpscaleError::load_failure(
                &descriptor.name,
                "model file not found",
            ));
        }
        Ok(Arc::new(NearestModel {
            factor: self.output_factor.unwrap_or(descriptor.native_scale),
            descriptor: descriptor.clone(),
            calls: Arc::clone(&self.upscales),
        }))
    }
}

/// Nearest-neighbour resize by a fixed factor.
pub struct NearestModel {
    descriptor: ModelDescriptor,
    factor: u32,
    calls: Arc<AtomicUsize>,
}

impl UpscaleModel for NearestModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn upscale(&self, image: &RgbImage) -> Result<RgbImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (w, h) = image.dimensions();
        Ok(image::imageops::resize(
            image,
            w * self.factor,
            h * self.factor,
            FilterType::Nearest,
        ))
    }
}

/// A 1x1 PNG whose IHDR claims `width`x`height`. Only the header is valid
/// for the claimed size; the pixel data stays a single pixel.
pub fn png_with_declared_size(width: u32, height: u32) -> Vec<u8> {
    let pixel = RgbImage::from_pixel(1, 1, image::Rgb([90, 90, 90]));
    let mut bytes = crate::codec::encode_image(&pixel, crate::codec::OutputFormat::Png, 95)
        .expect("encode 1x1 png");
    // Signature (8), chunk length (4), "IHDR" (4), then width and height.
    assert_eq!(&bytes[12..16], b"IHDR");
    bytes[16..20].copy_from_slice(&width.to_be_bytes());
    bytes[20..24].copy_from_slice(&height.to_be_bytes());
    let crc = crc32(&bytes[12..29]);
    bytes[29..33].copy_from_slice(&crc.to_be_bytes());
    bytes
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}
