//! Request-level orchestration: validate, prepare, infer, reconcile scale.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use tracing::{debug, info};

use crate::config::{AppConfig, LimitsConfig};
use crate::error::UpscaleError;
use crate::inference::OnnxLoader;
use crate::model_registry::ModelRegistry;
use crate::preprocess;

pub const SUPPORTED_SCALES: [u32; 2] = [2, 4];
pub const DEFAULT_SCALE: u32 = 4;

/// Output multiplier a caller may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputScale {
    X2,
    X4,
}

impl OutputScale {
    pub fn factor(self) -> u32 {
        match self {
            Self::X2 => 2,
            Self::X4 => 4,
        }
    }
}

impl TryFrom<u32> for OutputScale {
    type Error = UpscaleError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::X2),
            4 => Ok(Self::X4),
            _ => Err(UpscaleError::Validation(format!(
                "Scale must be 2 or 4, got {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpscaleRequest {
    pub image: DynamicImage,
    pub model: String,
    pub scale: u32,
}

#[derive(Debug, Clone)]
pub struct UpscaleResult {
    pub image: RgbImage,
    pub model: String,
    pub scale: u32,
    pub native_scale: u32,
    /// The output was resized from the model's native scale.
    pub derived: bool,
    /// Dimensions as uploaded.
    pub input_dimensions: (u32, u32),
    /// Dimensions fed to the model, after any downscale.
    pub effective_dimensions: (u32, u32),
    pub output_dimensions: (u32, u32),
    pub elapsed: Duration,
}

/// Runs upscale requests against a shared [`ModelRegistry`].
///
/// Cheap to share: the registry is behind an `Arc` and the limits are `Copy`.
pub struct Upscaler {
    registry: Arc<ModelRegistry>,
    limits: LimitsConfig,
}

impl Upscaler {
    pub fn new(registry: Arc<ModelRegistry>, limits: LimitsConfig) -> Self {
        Self { registry, limits }
    }

    /// ONNX-backed upscaler described by `config`, with relative paths
    /// resolved against `data_dir`. No model is loaded here.
    pub fn from_config(config: &AppConfig, data_dir: &Path) -> Self {
        let loader = OnnxLoader::new(&config.inference, Some(config.trt_cache_dir(data_dir)));
        let registry = ModelRegistry::new(config.models_dir(data_dir), Arc::new(loader));
        Self::new(Arc::new(registry), config.limits)
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Upscale one image. Blocking and CPU-bound; async callers should run it
    /// on a blocking thread.
    ///
    /// Scale, model name and image size are all checked before the model is
    /// loaded or any inference runs.
    pub fn upscale(&self, request: UpscaleRequest) -> Result<UpscaleResult, UpscaleError> {
        let started = Instant::now();
        let UpscaleRequest { image, model, scale } = request;

        let scale = OutputScale::try_from(scale)?;
        self.registry.validate_model_name(&model)?;
        let prepared = preprocess::prepare(image, &self.limits)?;

        let handle = self.registry.get_or_load(&model)?;
        let native_scale = handle.descriptor().native_scale;
        let (eff_w, eff_h) = prepared.image.dimensions();

        let raw = handle
            .upscale(&prepared.image)
            .map_err(|e| UpscaleError::inference(&e))?;

        let expected = (eff_w * native_scale, eff_h * native_scale);
        if raw.dimensions() != expected {
            return Err(UpscaleError::Inference(format!(
                "model '{model}' produced {}x{}, expected {}x{}",
                raw.width(),
                raw.height(),
                expected.0,
                expected.1
            )));
        }

        let factor = scale.factor();
        let derived = factor != native_scale;
        let image = if derived {
            let (w, h) = (eff_w * factor, eff_h * factor);
            debug!(
                native_scale,
                requested = factor,
                from = ?expected,
                to = ?(w, h),
                "Reconciling native output to requested scale"
            );
            imageops::resize(&raw, w, h, FilterType::Lanczos3)
        } else {
            raw
        };

        let result = UpscaleResult {
            output_dimensions: image.dimensions(),
            image,
            model,
            scale: factor,
            native_scale,
            derived,
            input_dimensions: prepared.original_dimensions,
            effective_dimensions: (eff_w, eff_h),
            elapsed: started.elapsed(),
        };

        info!(
            model = %result.model,
            scale = result.scale,
            derived = result.derived,
            input = ?result.input_dimensions,
            output = ?result.output_dimensions,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Upscale complete"
        );
        Ok(result)
    }
}
