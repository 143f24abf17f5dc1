//! Real-ESRGAN upscaling: model registry, tiled ONNX inference and the HTTP API.

pub mod codec;
pub mod config;
pub mod error;
pub mod inference;
pub mod logging;
pub mod model_registry;
pub mod pipeline;
pub mod preprocess;
pub mod runtime;
pub mod server;

#[cfg(test)]
mod testing;
