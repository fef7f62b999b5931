use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// API Error with rich context and automatic error trait implementations
///
/// Design: Uses thiserror for ergonomic error handling with context.
/// Each variant carries meaningful context to help with debugging.
#[derive(Error, Debug)]
pub enum ApiError {
    // Validation errors 1xxx
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Empty SQL")]
    EmptySql,

    // Policy errors 2xxx
    #[error("Write operations are not allowed")]
    WriteNotAllowed,

    #[error("Only SELECT queries are allowed")]
    StatementNotAllowed,

    #[error("Join limit exceeded: {joins}/{max_joins}")]
    JoinLimitExceeded { joins: usize, max_joins: usize },

    #[error("WHERE clause required")]
    WhereRequired,

    #[error("Table not allowed: {0}")]
    TableNotAllowed(String),

    // Resource errors 3xxx
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Query {qid} not found")]
    QueryNotFound { qid: String },

    // Generation errors 4xxx
    #[error("SQL generation failed: {0}")]
    GenerationFailed(String),

    #[error("LLM provider error: {0}")]
    LlmError(String),

    #[error("LLM call timed out after {0}s")]
    LlmTimeout(u64),

    // System errors 5xxx
    #[error("Internal error: {0}")]
    InternalError(String),

    // Database errors - auto-convert from sqlx::Error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Execution errors 6xxx
    #[error("SQL execution failed ({error_class}): {message}")]
    ExecutionFailed {
        error_class: String,
        message: String,
        query_hash: String,
        elapsed_ms: u64,
        timeout_ms: u64,
    },

    #[error("Oracle gateway unreachable: {0}")]
    GatewayUnreachable(String),

    // Generic wrapper for other errors - auto-convert from anyhow::Error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    /// Helper to create validation error
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    /// Helper to create invalid input error
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Helper to create not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::ResourceNotFound(message.into())
    }

    /// Helper to create internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// Helper to create generation failure error
    pub fn generation_failed(message: impl Into<String>) -> Self {
        Self::GenerationFailed(message.into())
    }

    /// Get legacy error code for backward compatibility
    pub fn error_code(&self) -> i32 {
        match self {
            // Validation errors 1xxx
            Self::ValidationError(_) => 1001,
            Self::InvalidInput(_) => 1002,
            Self::EmptySql => 1003,

            // Policy errors 2xxx
            Self::WriteNotAllowed => 2001,
            Self::StatementNotAllowed => 2002,
            Self::JoinLimitExceeded { .. } => 2003,
            Self::WhereRequired => 2004,
            Self::TableNotAllowed(_) => 2005,

            // Resource errors 3xxx
            Self::ResourceNotFound(_) => 3000,
            Self::QueryNotFound { .. } => 3001,

            // Generation errors 4xxx
            Self::GenerationFailed(_) => 4001,
            Self::LlmError(_) => 4002,
            Self::LlmTimeout(_) => 4003,

            // System errors 5xxx
            Self::InternalError(_) => 5001,
            Self::Database(_) => 5002,
            Self::Other(_) => 5001,

            // Execution errors 6xxx
            Self::ExecutionFailed { .. } => 6001,
            Self::GatewayUnreachable(_) => 6002,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::WriteNotAllowed | Self::WhereRequired | Self::TableNotAllowed(_) => {
                StatusCode::FORBIDDEN
            }
            Self::ValidationError(_)
            | Self::InvalidInput(_)
            | Self::EmptySql
            | Self::StatementNotAllowed
            | Self::JoinLimitExceeded { .. }
            | Self::ExecutionFailed { .. } => StatusCode::BAD_REQUEST,
            Self::ResourceNotFound(_) | Self::QueryNotFound { .. } => StatusCode::NOT_FOUND,
            Self::LlmTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::GenerationFailed(_) | Self::LlmError(_) => StatusCode::BAD_GATEWAY,
            Self::InternalError(_)
            | Self::Database(_)
            | Self::GatewayUnreachable(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body shared by all handlers
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let status = self.status();

        let details = match &self {
            ApiError::ExecutionFailed {
                error_class,
                query_hash,
                elapsed_ms,
                timeout_ms,
                ..
            } => Some(serde_json::json!({
                "error_class": error_class,
                "query_hash": query_hash,
                "elapsed_ms": elapsed_ms,
                "timeout_ms": timeout_ms,
            })),
            _ => None,
        };

        let response = ApiErrorResponse { code, message: self.to_string(), details };

        (status, Json(response)).into_response()
    }
}

/// Implement From for serde_json::Error
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::internal_error(format!("JSON serialization error: {}", err))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
