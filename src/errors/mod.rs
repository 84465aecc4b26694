//! Error handling shared by the client data layer and the reference backend.
//!
//! The backend maps [`AppError`] to HTTP status codes and an error envelope;
//! the client maps the envelope's code back to the same variant.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const CONFLICT: &str = "CONFLICT";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const SEARCH_ERROR: &str = "SEARCH_ERROR";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const REALTIME_ERROR: &str = "REALTIME_ERROR";
}

/// Application error type.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Missing or invalid API key / session
    Unauthorized(String),
    /// Resource not found
    NotFound(String),
    /// Input rejected by a business rule
    Validation(String),
    /// Uniqueness or state conflict
    Conflict(String),
    /// Database error
    Database(String),
    /// Search index error
    Search(String),
    /// Transport failure talking to the backend
    Network(String),
    /// Realtime channel failure
    Realtime(String),
    /// Internal error
    Internal(String),
    /// Malformed request
    BadRequest(String),
}

impl AppError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Search(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Network(_) => StatusCode::BAD_GATEWAY,
            AppError::Realtime(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => codes::UNAUTHORIZED,
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::Validation(_) => codes::VALIDATION_ERROR,
            AppError::Conflict(_) => codes::CONFLICT,
            AppError::Database(_) => codes::DATABASE_ERROR,
            AppError::Search(_) => codes::SEARCH_ERROR,
            AppError::Network(_) => codes::NETWORK_ERROR,
            AppError::Realtime(_) => codes::REALTIME_ERROR,
            AppError::Internal(_) => codes::INTERNAL_ERROR,
            AppError::BadRequest(_) => codes::BAD_REQUEST,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            AppError::Unauthorized(msg)
            | AppError::NotFound(msg)
            | AppError::Validation(msg)
            | AppError::Conflict(msg)
            | AppError::Database(msg)
            | AppError::Search(msg)
            | AppError::Network(msg)
            | AppError::Realtime(msg)
            | AppError::Internal(msg)
            | AppError::BadRequest(msg) => msg.clone(),
        }
    }

    /// Rebuild an error from a code received in an error envelope.
    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            codes::UNAUTHORIZED => AppError::Unauthorized(message),
            codes::NOT_FOUND => AppError::NotFound(message),
            codes::VALIDATION_ERROR => AppError::Validation(message),
            codes::CONFLICT => AppError::Conflict(message),
            codes::DATABASE_ERROR => AppError::Database(message),
            codes::SEARCH_ERROR => AppError::Search(message),
            codes::NETWORK_ERROR => AppError::Network(message),
            codes::REALTIME_ERROR => AppError::Realtime(message),
            codes::BAD_REQUEST => AppError::BadRequest(message),
            _ => AppError::Internal(message),
        }
    }

    /// Expected errors are the user's to fix; everything else is unexpected.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            AppError::Unauthorized(_)
                | AppError::NotFound(_)
                | AppError::Validation(_)
                | AppError::Conflict(_)
                | AppError::BadRequest(_)
        )
    }

    /// Short text for a transient toast.
    pub fn toast_message(&self) -> String {
        match self {
            AppError::Unauthorized(_) => "Please sign in again to continue.".to_string(),
            AppError::Network(_) | AppError::Realtime(_) => {
                "Can't reach the server. Check your connection and try again.".to_string()
            }
            e if e.is_expected() => e.message(),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::RowNotFound = err {
            return AppError::NotFound("Row not found".to_string());
        }
        if let Some(db_err) = err.as_database_error() {
            if db_err.is_unique_violation() {
                return AppError::Conflict(format!("Duplicate row: {}", db_err.message()));
            }
            if db_err.is_check_violation() || db_err.is_foreign_key_violation() {
                return AppError::Validation(format!("Constraint failed: {}", db_err.message()));
            }
        }
        tracing::error!("Database error: {:?}", err);
        AppError::Database(format!("Database error: {}", err))
    }
}

impl From<tantivy::TantivyError> for AppError {
    fn from(err: tantivy::TantivyError) -> Self {
        tracing::error!("Search error: {:?}", err);
        AppError::Search(format!("Search error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON error: {:?}", err);
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        tracing::warn!("Backend request failed: {}", err);
        if err.is_decode() {
            return AppError::Internal(format!("Unexpected response body: {}", err));
        }
        AppError::Network(format!("Request failed: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        tracing::warn!("Realtime channel error: {}", err);
        AppError::Realtime(format!("Realtime error: {}", err))
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        AppError::BadRequest(format!("Invalid URL: {}", err))
    }
}

/// Log a failure on a non-critical path and carry on without the value.
pub fn log_ignored<T>(context: &str, result: Result<T, AppError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("{} failed (ignored): {}", context, e);
            None
        }
    }
}

/// Error details in the response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Error response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetails,
}

impl ErrorResponse {
    pub fn new(error: &AppError) -> Self {
        Self {
            success: false,
            error: ErrorDetails {
                code: error.error_code().to_string(),
                message: error.message(),
                details: None,
            },
        }
    }

    pub fn into_error(self) -> AppError {
        AppError::from_code(&self.error.code, self.error.message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::new(&self);
        (status, Json(body)).into_response()
    }
}
