//! Error types for the TEE execution service

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TeeError>;

#[derive(Debug, Error)]
pub enum TeeError {
    #[error("{0}")]
    Validation(String),

    #[error("environment not found or not ready")]
    NotFound,

    #[error("request body exceeds 1 MB limit")]
    RequestTooLarge,

    #[error("operation cancelled before admission")]
    Cancelled,

    #[error("environment setup failed: {0}")]
    SetupFailed(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TeeError {
    /// Stable machine-readable code included in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound => "not_found",
            Self::RequestTooLarge => "request_too_large",
            Self::Cancelled => "cancelled",
            Self::SetupFailed(_) => "setup_failed",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::Runtime(_) => "runtime_error",
            Self::Database(_) => "database_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal",
        }
    }
}

impl actix_web::error::ResponseError for TeeError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        }))
    }
}
