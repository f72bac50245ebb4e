use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failures raised by the ingestion pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Preset table missing, unreadable, or malformed. Operator problem.
    #[error("preset configuration error: {0}")]
    Configuration(String),
    #[error("no files in upload batch")]
    EmptyBatch,
    #[error("{}", describe_unknown(.resize, .scale))]
    UnknownOption {
        resize: Vec<String>,
        scale: Vec<String>,
    },
    #[error("batch has {count} files, at most {max} allowed")]
    TooManyFiles { count: usize, max: usize },
    #[error("file `{name}` is {size} bytes, limit is {max}")]
    FileTooLarge { name: String, size: u64, max: u64 },
    #[error("file `{name}` has an extension that is not allowed")]
    ExtensionNotAllowed { name: String },
    #[error("image processing failed for `{name}`: {reason}")]
    ImageProcessing { name: String, reason: String },
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("storage I/O error at {path}: {source}")]
    StorageIo {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn storage(path: impl AsRef<std::path::Path>, source: io::Error) -> Self {
        Self::StorageIo {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn image(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::ImageProcessing {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

fn describe_unknown(resize: &[String], scale: &[String]) -> String {
    let mut parts = Vec::new();
    if !scale.is_empty() {
        parts.push(format!("unknown scale option(s): {}", scale.join(",")));
    }
    if !resize.is_empty() {
        parts.push(format!("unknown resize option(s): {}", resize.join(",")));
    }
    parts.join("; ")
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::EmptyBatch
            | PipelineError::UnknownOption { .. }
            | PipelineError::TooManyFiles { .. }
            | PipelineError::ExtensionNotAllowed { .. } => StatusCode::BAD_REQUEST,
            PipelineError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::ImageProcessing { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Configuration(_)
            | PipelineError::StorageIo { .. }
            | PipelineError::Sqlx(_) => {
                tracing::error!(error = %err, "request failed");
                return AppError::internal(err.to_string());
            }
        };
        AppError::new(status, err.to_string())
    }
}
