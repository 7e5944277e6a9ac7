//! Error taxonomy shared by every RAG Harness component.
//!
//! Each [`RagError`] carries an [`ErrorKind`] that decides two things at
//! the API boundary: the machine-readable `error_type` string and whether
//! the caller may retry. Internal failures are never surfaced raw; they
//! cross the boundary as an [`ErrorBody`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Network,
    Timeout,
    RateLimit,
    ModelLoading,
    ModelUnavailable,
    ModelDownload,
    DimensionMismatch,
    Generation,
    CaptionExists,
    Unexpected,
}

impl ErrorKind {
    /// The `error_type` string used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ModelLoading => "model_loading",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::ModelDownload => "model_download",
            ErrorKind::DimensionMismatch => "dimension_mismatch",
            ErrorKind::Generation => "generation",
            ErrorKind::CaptionExists => "caption_exists",
            ErrorKind::Unexpected => "unexpected",
        }
    }

    /// Default retry policy for the kind. Individual errors may override it.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::RateLimit
                | ErrorKind::ModelUnavailable
                | ErrorKind::ModelDownload
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by chunking, embedding, model lifecycle, storage, and indexing.
#[derive(Debug, Clone, Error)]
pub enum RagError {
    #[error("{0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("failed to load model {model_id}: {reason}")]
    ModelLoading { model_id: String, reason: String },

    #[error("model {model_id} unavailable: {reason}")]
    ModelUnavailable {
        model_id: String,
        reason: String,
        retryable: bool,
    },

    #[error("model {model_id} download failed: {reason}")]
    ModelDownload { model_id: String, reason: String },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("caption already exists for {0}")]
    CaptionExists(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl RagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RagError::Validation(_) => ErrorKind::Validation,
            RagError::Network(_) => ErrorKind::Network,
            RagError::Timeout(_) => ErrorKind::Timeout,
            RagError::RateLimited(_) => ErrorKind::RateLimit,
            RagError::ModelLoading { .. } => ErrorKind::ModelLoading,
            RagError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            RagError::ModelDownload { .. } => ErrorKind::ModelDownload,
            RagError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            RagError::Generation(_) => ErrorKind::Generation,
            RagError::CaptionExists(_) => ErrorKind::CaptionExists,
            RagError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Whether a caller may retry the failed operation.
    pub fn retryable(&self) -> bool {
        match self {
            RagError::ModelUnavailable { retryable, .. } => *retryable,
            other => other.kind().default_retryable(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        RagError::Validation(msg.into())
    }

    pub fn unexpected(msg: impl std::fmt::Display) -> Self {
        RagError::Unexpected(msg.to_string())
    }

    /// Convert into the structured body that crosses the API boundary.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            error_type: self.kind(),
            retryable: self.retryable(),
        }
    }
}

impl From<anyhow::Error> for RagError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RagError>() {
            Ok(rag) => rag,
            Err(other) => RagError::Unexpected(format!("{:#}", other)),
        }
    }
}

impl From<std::io::Error> for RagError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => RagError::Timeout(err.to_string()),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                RagError::Validation(err.to_string())
            }
            _ => RagError::Unexpected(err.to_string()),
        }
    }
}

/// `{error, error_type, retryable}`, the only error shape callers see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_type: ErrorKind,
    pub retryable: bool,
}

pub type RagResult<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_by_kind() {
        assert!(RagError::Timeout("x".into()).retryable());
        assert!(RagError::Network("x".into()).retryable());
        assert!(RagError::RateLimited("x".into()).retryable());
        assert!(!RagError::validation("bad").retryable());
        assert!(!RagError::DimensionMismatch {
            expected: 3,
            actual: 4
        }
        .retryable());
    }

    #[test]
    fn test_model_unavailable_override() {
        let queued = RagError::ModelUnavailable {
            model_id: "bge-m3".into(),
            reason: "still loading".into(),
            retryable: true,
        };
        let unknown = RagError::ModelUnavailable {
            model_id: "nope".into(),
            reason: "not registered".into(),
            retryable: false,
        };
        assert!(queued.retryable());
        assert!(!unknown.retryable());
    }

    #[test]
    fn test_body_serialization() {
        let body = RagError::DimensionMismatch {
            expected: 768,
            actual: 3,
        }
        .to_body();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error_type"], "dimension_mismatch");
        assert_eq!(json["retryable"], false);
        assert!(json["error"].as_str().unwrap().contains("768"));
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_kind() {
        let err: anyhow::Error = RagError::Timeout("slow".into()).into();
        let back: RagError = err.into();
        assert_eq!(back.kind(), ErrorKind::Timeout);
    }
}
