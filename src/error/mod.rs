use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("HTTP error: {0}")]
    Http(#[from] ApiError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Corrupt record in {table}: {message}")]
    Serialization { table: String, message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Errors from a single call to the generative text API.
///
/// The retry orchestrator only looks at [`GenerationError::is_truncation`] and
/// [`GenerationError::is_malformed_output`]; everything else is fatal.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Response incomplete: output hit max_output_tokens ({max_output_tokens})")]
    Truncated { max_output_tokens: u32 },

    #[error("Malformed model output: {message}")]
    MalformedOutput { message: String },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GenerationError {
    /// Output was cut off by the output-token ceiling.
    pub fn is_truncation(&self) -> bool {
        matches!(self, GenerationError::Truncated { .. })
    }

    /// Output arrived but could not be parsed into the expected shape.
    pub fn is_malformed_output(&self) -> bool {
        matches!(self, GenerationError::MalformedOutput { .. })
    }
}

impl From<serde_json::Error> for GenerationError {
    fn from(err: serde_json::Error) -> Self {
        GenerationError::MalformedOutput {
            message: err.to_string(),
        }
    }
}

/// HTTP-facing error payload detail.
#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorDetail {
    /// Stable error code identifier.
    pub error_code: String,
    /// Human readable message.
    pub message: String,
}

/// HTTP-facing error response wrapper.
#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorResponse {
    /// Error detail.
    pub error: ApiErrorDetail,
}

/// Errors returned by the REST endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest { message: String },

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("{message}")]
    NotFound { message: String },

    #[error("{message}")]
    Internal { message: String },
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::RunNotFound { .. } => (StatusCode::NOT_FOUND, "RUN_NOT_FOUND"),
            ApiError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = ApiErrorResponse {
            error: ApiErrorDetail {
                error_code: code.to_string(),
                message: self.to_string(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError::Internal {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for generative API calls
pub type GenerationResult<T> = Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::Internal {
            message: "unexpected".to_string(),
        };
        assert_eq!(err.to_string(), "Internal error: unexpected");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Connection {
            message: "failed to connect".to_string(),
        };
        assert_eq!(err.to_string(), "Database connection failed: failed to connect");

        let err = StorageError::Serialization {
            table: "runs".to_string(),
            message: "unknown status".to_string(),
        };
        assert_eq!(err.to_string(), "Corrupt record in runs: unknown status");
    }

    #[test]
    fn test_generation_error_classification() {
        let truncated = GenerationError::Truncated {
            max_output_tokens: 300,
        };
        assert!(truncated.is_truncation());
        assert!(!truncated.is_malformed_output());

        let malformed = GenerationError::MalformedOutput {
            message: "expected value".to_string(),
        };
        assert!(malformed.is_malformed_output());
        assert!(!malformed.is_truncation());

        let fatal = GenerationError::Api {
            status: 401,
            message: "unauthorized".to_string(),
        };
        assert!(!fatal.is_truncation());
        assert!(!fatal.is_malformed_output());
    }

    #[test]
    fn test_serde_error_maps_to_malformed_output() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: GenerationError = parse_err.into();
        assert!(err.is_malformed_output());
    }

    #[test]
    fn test_api_error_status_codes() {
        let resp = ApiError::RunNotFound {
            run_id: "run-1".to_string(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ApiError::BadRequest {
            message: "projectId required".to_string(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_storage_error_conversion_to_app_error() {
        let storage_err = StorageError::Query {
            message: "syntax".to_string(),
        };
        let app_err: AppError = storage_err.into();
        assert!(matches!(app_err, AppError::Storage(_)));
    }

    #[test]
    fn test_app_error_conversion_to_api_error() {
        let app_err = AppError::Config {
            message: "test error".to_string(),
        };
        let api_err: ApiError = app_err.into();
        assert!(matches!(api_err, ApiError::Internal { .. }));
        assert!(api_err.to_string().contains("Configuration error"));
    }
}
