//! Error kinds surfaced by the upscale pipeline.
//!
//! The set is closed: callers (the HTTP façade, the CLI) decide how each kind
//! is presented. Infrastructure code outside the request path keeps using
//! `anyhow` with context.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpscaleError {
    /// Caller-fixable input problem: bad scale, unknown model, oversized
    /// image, malformed base64.
    #[error("{0}")]
    Validation(String),

    /// The payload bytes are not a decodable image.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// Model weights are missing or could not be turned into a session.
    #[error("failed to load model '{model}': {reason}")]
    LoadFailure { model: String, reason: String },

    /// Anything that went wrong inside the inference call.
    #[error("inference failed: {0}")]
    Inference(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Decode,
    LoadFailure,
    Inference,
}

impl UpscaleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Decode(_) => ErrorKind::Decode,
            Self::LoadFailure { .. } => ErrorKind::LoadFailure,
            Self::Inference(_) => ErrorKind::Inference,
        }
    }

    /// `true` for errors the caller can fix by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::Decode)
    }

    pub fn load_failure(model: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::LoadFailure {
            model: model.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap an `anyhow` chain from the backend, keeping every cause.
    pub fn inference(err: &anyhow::Error) -> Self {
        Self::Inference(format!("{err:#}"))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Decode => write!(f, "decode"),
            Self::LoadFailure => write!(f, "load_failure"),
            Self::Inference => write!(f, "inference"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_validation_and_decode() {
        assert!(UpscaleError::Validation("bad scale".into()).is_client_error());
        assert!(UpscaleError::Decode("truncated".into()).is_client_error());
        assert!(!UpscaleError::load_failure("m", "missing").is_client_error());
        assert!(!UpscaleError::Inference("boom".into()).is_client_error());
    }

    #[test]
    fn inference_keeps_cause_chain() {
        let err = anyhow::anyhow!("session.run failed").context("tile 0,0");
        let wrapped = UpscaleError::inference(&err);
        let text = wrapped.to_string();
        assert!(text.contains("tile 0,0"));
        assert!(text.contains("session.run failed"));
    }

    #[test]
    fn load_failure_message_names_model() {
        let err = UpscaleError::load_failure("realesrgan-x4plus", "model file not found");
        assert_eq!(
            err.to_string(),
            "failed to load model 'realesrgan-x4plus': model file not found"
        );
        assert_eq!(err.kind(), ErrorKind::LoadFailure);
        assert_eq!(err.kind().to_string(), "load_failure");
    }
}
