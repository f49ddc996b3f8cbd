use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// A single failed field in a request body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error taxonomy of the daemon. The HTTP status is fixed by the kind at the
/// point of construction; handlers never pick status codes ad hoc.
#[derive(Debug, Error)]
pub enum NexusError {
    #[error("{}", format_fields(.0))]
    Validation(Vec<FieldError>),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Database(String),
    #[error("{0}")]
    Gpu(String),
    #[error("{0}")]
    Runner(String),
    #[error("{0}")]
    Notification(String),
}

fn format_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

impl NexusError {
    pub fn code(&self) -> &'static str {
        match self {
            NexusError::Validation(_) => "VALIDATION_ERROR",
            NexusError::InvalidRequest(_) => "INVALID_REQUEST",
            NexusError::NotFound(_) => "NOT_FOUND",
            NexusError::InvalidState(_) => "INVALID_STATE",
            NexusError::Auth(_) => "AUTH_ERROR",
            NexusError::Database(_) => "DB_ERROR",
            NexusError::Gpu(_) => "GPU_ERROR",
            NexusError::Runner(_) => "JOB_ERROR",
            NexusError::Notification(_) => "WEBHOOK_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            NexusError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            NexusError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            NexusError::NotFound(_) => StatusCode::NOT_FOUND,
            NexusError::InvalidState(_) => StatusCode::BAD_REQUEST,
            NexusError::Auth(_) => StatusCode::UNAUTHORIZED,
            NexusError::Database(_)
            | NexusError::Gpu(_)
            | NexusError::Runner(_)
            | NexusError::Notification(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for NexusError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("API error: {} - {}", self.code(), self);
        } else {
            tracing::warn!("API error: {} - {}", self.code(), self);
        }

        let mut body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
            "status_code": status.as_u16(),
        });
        if let NexusError::Validation(fields) = &self {
            body["detail"] = serde_json::json!(fields);
        }

        (status, Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for NexusError {
    fn from(e: rusqlite::Error) -> Self {
        NexusError::Database(e.to_string())
    }
}

impl From<r2d2::Error> for NexusError {
    fn from(e: r2d2::Error) -> Self {
        NexusError::Database(format!("connection pool error: {e}"))
    }
}
