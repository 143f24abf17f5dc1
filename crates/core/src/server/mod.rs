use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::header::{CONTENT_TYPE, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::codec::{self, OutputFormat};
use crate::config::{AppConfig, LimitsConfig, OutputConfig};
use crate::error::UpscaleError;
use crate::model_registry::{ModelRegistry, DEFAULT_MODEL};
use crate::pipeline::{
    OutputScale, UpscaleRequest, UpscaleResult, Upscaler, DEFAULT_SCALE, SUPPORTED_SCALES,
};

const SERVICE_MESSAGE: &str = "Real-ESRGAN Image Upscaler API";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    upscaler: Upscaler,
    output: OutputConfig,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(upscaler: Upscaler, output: OutputConfig, max_upload_bytes: usize) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                upscaler,
                output,
                max_upload_bytes,
            }),
        }
    }

    pub fn from_config(config: &AppConfig, data_dir: &Path) -> Self {
        Self::new(
            Upscaler::from_config(config, data_dir),
            config.output,
            config.server.max_upload_bytes,
        )
    }

    pub fn upscaler(&self) -> &Upscaler {
        &self.inner.upscaler
    }

    fn registry(&self) -> &ModelRegistry {
        self.inner.upscaler.registry()
    }
}

#[derive(Serialize)]
pub struct RootResponse {
    pub message: String,
    pub available_models: Vec<String>,
    pub supported_scales: Vec<u32>,
    pub max_input_size: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub models_loaded: usize,
    pub loaded_models: Vec<String>,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub available_models: Vec<String>,
    pub model_descriptions: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct Base64UpscaleRequest {
    pub image_data: String,
    #[serde(default = "default_scale")]
    pub scale: u32,
    #[serde(default = "default_model")]
    pub model: String,
}

#[derive(Serialize)]
pub struct Base64UpscaleResponse {
    pub success: bool,
    pub image: String,
    pub metadata: UpscaleMetadata,
}

#[derive(Serialize)]
pub struct UpscaleMetadata {
    pub original_size: [u32; 2],
    pub effective_size: [u32; 2],
    pub upscaled_size: [u32; 2],
    pub scale_factor: u32,
    pub native_scale: u32,
    pub scale_derived: bool,
    pub model_used: String,
    pub output_format: OutputFormat,
    pub processing_time_seconds: f64,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn default_scale() -> u32 {
    DEFAULT_SCALE
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

pub fn app_router(state: AppState) -> Router {
    let body_limit = state.inner.max_upload_bytes;
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/upscale/binary", post(upscale_binary))
        .route("/upscale/base64", post(upscale_base64))
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    let max = state.upscaler().limits().max_input_dimension;
    Json(RootResponse {
        message: SERVICE_MESSAGE.to_string(),
        available_models: state.registry().supported_names(),
        supported_scales: SUPPORTED_SCALES.to_vec(),
        max_input_size: format!("{max}x{max}"),
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let loaded_models = state.registry().loaded_names();
    Json(HealthResponse {
        status: "healthy".to_string(),
        models_loaded: loaded_models.len(),
        loaded_models,
    })
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let registry = state.registry();
    Json(ModelsResponse {
        available_models: registry.supported_names(),
        model_descriptions: registry
            .catalog()
            .iter()
            .map(|d| (d.name.clone(), d.description.clone()))
            .collect(),
    })
}

async fn route_not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("route not found: {}", uri.path()))
}

enum ImagePayload {
    Raw(Bytes),
    Base64(String),
}

impl ImagePayload {
    fn decode(&self, limits: &LimitsConfig) -> Result<DynamicImage, UpscaleError> {
        match self {
            Self::Raw(bytes) => codec::decode_image(bytes, limits),
            Self::Base64(text) => codec::decode_base64_image(text, limits),
        }
    }
}

struct Upscaled {
    result: UpscaleResult,
    bytes: Vec<u8>,
    format: OutputFormat,
    /// Wall time from request arrival until the response body was encoded.
    elapsed: Duration,
}

/// Validate parameters, decode, upscale and encode on a blocking thread.
async fn run_upscale(
    state: &AppState,
    payload: ImagePayload,
    model: String,
    scale: u32,
    started: Instant,
) -> Result<Upscaled, AppError> {
    let state = state.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<Upscaled, AppError> {
        OutputScale::try_from(scale)?;
        state.registry().validate_model_name(&model)?;
        let image = payload.decode(state.upscaler().limits())?;

        let result = state.upscaler().upscale(UpscaleRequest {
            image,
            model,
            scale,
        })?;

        let output = state.inner.output;
        let bytes = codec::encode_image(&result.image, output.format, output.jpeg_quality)?;
        Ok(Upscaled {
            result,
            bytes,
            format: output.format,
            elapsed: started.elapsed(),
        })
    })
    .await
    .map_err(|e| AppError::Internal(format!("task join error: {e}")))?;

    if let Err(err) = &outcome {
        match err {
            AppError::BadRequest(msg) => warn!(error = %msg, "Upscale request rejected"),
            other => error!(error = %other.message(), "Upscale request failed"),
        }
    }
    outcome
}

async fn upscale_binary(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let mut file: Option<Bytes> = None;
    let mut scale = DEFAULT_SCALE;
    let mut model = DEFAULT_MODEL.to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                file = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::BadRequest(e.body_text()))?,
                );
            }
            "scale" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.body_text()))?;
                scale = parse_scale_field(&text)?;
            }
            "model" => {
                model = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.body_text()))?
                    .trim()
                    .to_string();
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| AppError::BadRequest("Missing required field: file".into()))?;
    info!(bytes = file.len(), %model, scale, "Binary upscale request");

    let upscaled = run_upscale(&state, ImagePayload::Raw(file), model, scale, started).await?;
    let result = &upscaled.result;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(upscaled.format.mime_type()),
    );
    let metadata = [
        ("x-processing-time", format!("{:.3}", upscaled.elapsed.as_secs_f64())),
        ("x-input-dimensions", dimensions(result.input_dimensions)),
        ("x-output-dimensions", dimensions(result.output_dimensions)),
        ("x-model-used", result.model.clone()),
        ("x-scale-factor", result.scale.to_string()),
        ("x-scale-derived", result.derived.to_string()),
    ];
    for (name, value) in metadata {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| AppError::Internal(format!("invalid header value for {name}: {e}")))?;
        headers.insert(HeaderName::from_static(name), value);
    }

    Ok((StatusCode::OK, headers, upscaled.bytes).into_response())
}

async fn upscale_base64(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<Base64UpscaleResponse>, AppError> {
    let started = Instant::now();
    let body = parse_base64_request(request).await?;
    info!(
        chars = body.image_data.len(),
        model = %body.model,
        scale = body.scale,
        "Base64 upscale request"
    );

    let upscaled = run_upscale(
        &state,
        ImagePayload::Base64(body.image_data),
        body.model,
        body.scale,
        started,
    )
    .await?;
    let result = upscaled.result;

    Ok(Json(Base64UpscaleResponse {
        success: true,
        image: codec::encode_base64(&upscaled.bytes),
        metadata: UpscaleMetadata {
            original_size: result.input_dimensions.into(),
            effective_size: result.effective_dimensions.into(),
            upscaled_size: result.output_dimensions.into(),
            scale_factor: result.scale,
            native_scale: result.native_scale,
            scale_derived: result.derived,
            model_used: result.model,
            output_format: upscaled.format,
            processing_time_seconds: (upscaled.elapsed.as_secs_f64() * 100.0).round() / 100.0,
        },
    }))
}

/// Accept the base64 body as JSON, urlencoded form or multipart form.
async fn parse_base64_request(request: Request) -> Result<Base64UpscaleRequest, AppError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(body) = Form::<Base64UpscaleRequest>::from_request(request, &())
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        return Ok(body);
    }

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        let mut image_data = None;
        let mut scale = DEFAULT_SCALE;
        let mut model = DEFAULT_MODEL.to_string();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            let text = field
                .text()
                .await
                .map_err(|e| AppError::BadRequest(e.body_text()))?;
            match name.as_str() {
                "image_data" => image_data = Some(text),
                "scale" => scale = parse_scale_field(&text)?,
                "model" => model = text.trim().to_string(),
                _ => {}
            }
        }
        let image_data = image_data
            .ok_or_else(|| AppError::BadRequest("Missing required field: image_data".into()))?;
        return Ok(Base64UpscaleRequest {
            image_data,
            scale,
            model,
        });
    }

    let Json(body) = Json::<Base64UpscaleRequest>::from_request(request, &())
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?;
    Ok(body)
}

fn parse_scale_field(text: &str) -> Result<u32, AppError> {
    text.trim()
        .parse::<u32>()
        .map_err(|_| AppError::BadRequest(format!("scale must be an integer, got '{}'", text.trim())))
}

fn dimensions((w, h): (u32, u32)) -> String {
    format!("{w}x{h}")
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl AppError {
    fn message(&self) -> &str {
        match self {
            AppError::BadRequest(msg) | AppError::NotFound(msg) | AppError::Internal(msg) => msg,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<UpscaleError> for AppError {
    fn from(err: UpscaleError) -> Self {
        if err.is_client_error() {
            AppError::BadRequest(err.to_string())
        } else {
            AppError::Internal(err.to_string())
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}
