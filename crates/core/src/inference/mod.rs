//! Model handles: the loader seam used by the registry and the ONNX Runtime
//! implementation behind it.

mod backend;
pub mod tiling;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use image::RgbImage;
use ndarray::{Array4, ArrayD, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

pub use backend::{build_session, InferenceBackend, SessionConfig};

use crate::config::InferenceConfig;
use crate::error::UpscaleError;
use crate::model_registry::ModelDescriptor;
use tiling::TilePlan;

/// A loaded network that multiplies both image dimensions by
/// `descriptor().native_scale`.
///
/// Handles are shared between concurrent requests; implementations serialize
/// internally where the runtime requires it.
pub trait UpscaleModel: Send + Sync {
    fn descriptor(&self) -> &ModelDescriptor;

    fn upscale(&self, image: &RgbImage) -> Result<RgbImage>;
}

/// Turns a catalog entry into a live [`UpscaleModel`].
pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        descriptor: &ModelDescriptor,
        model_path: &Path,
    ) -> Result<Arc<dyn UpscaleModel>, UpscaleError>;
}

pub struct OnnxLoader {
    backend: InferenceBackend,
    intra_threads: usize,
    trt_cache_dir: Option<PathBuf>,
}

impl OnnxLoader {
    pub fn new(config: &InferenceConfig, trt_cache_dir: Option<PathBuf>) -> Self {
        Self {
            backend: config.backend,
            intra_threads: config.intra_threads,
            trt_cache_dir,
        }
    }
}

impl ModelLoader for OnnxLoader {
    fn load(
        &self,
        descriptor: &ModelDescriptor,
        model_path: &Path,
    ) -> Result<Arc<dyn UpscaleModel>, UpscaleError> {
        if !model_path.is_file() {
            return Err(UpscaleError::load_failure(
                &descriptor.name,
                format!("model file not found: {}", model_path.display()),
            ));
        }

        let session = build_session(&SessionConfig {
            model_path,
            backend: self.backend,
            trt_cache_dir: self.trt_cache_dir.as_deref(),
            intra_threads: self.intra_threads,
        })
        .map_err(|e| UpscaleError::load_failure(&descriptor.name, format!("{e:#}")))?;

        let model = OnnxModel::new(descriptor.clone(), session)
            .map_err(|e| UpscaleError::load_failure(&descriptor.name, format!("{e:#}")))?;
        Ok(Arc::new(model))
    }
}

pub struct OnnxModel {
    descriptor: ModelDescriptor,
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OnnxModel {
    fn new(descriptor: ModelDescriptor, session: Session) -> Result<Self> {
        let input = session
            .inputs()
            .first()
            .ok_or_else(|| anyhow!("model declares no inputs"))?;
        let output = session
            .outputs()
            .first()
            .ok_or_else(|| anyhow!("model declares no outputs"))?;

        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let detected_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        let is_fp16 = descriptor.is_fp16 || detected_fp16;

        debug!(
            model = %descriptor.name,
            %input_name, %output_name, is_fp16,
            "Detected model IO"
        );

        Ok(Self {
            descriptor,
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16,
        })
    }

    fn run_tile(&self, tile: Array4<f32>) -> Result<ArrayD<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;

        if self.is_fp16 {
            let input_tensor = Tensor::from_array(tiling::f32_to_f16(&tile)?)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<half::f16>()?;
            tiling::f16_to_f32(&output_view.to_owned())
        } else {
            let input_tensor = Tensor::from_array(tile)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            Ok(output_view.to_owned())
        }
    }
}

impl UpscaleModel for OnnxModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn upscale(&self, image: &RgbImage) -> Result<RgbImage> {
        let range = self.descriptor.normalization_range;
        let input = tiling::rgb_to_nchw(image, range);
        let plan = TilePlan {
            tile_size: self.descriptor.tile_size as usize,
            tile_pad: self.descriptor.tile_pad as usize,
            pad_align: self.descriptor.pad_align as usize,
            scale: self.descriptor.native_scale as usize,
        };
        let output = tiling::run_tiled(&input, plan, |tile| self.run_tile(tile))?;
        tiling::nchw_to_rgb(&output.into_dimensionality::<Ix4>()?, range)
    }
}
