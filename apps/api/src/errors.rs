use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Message returned to clients for any unrecovered generation failure.
/// The underlying cause only ever reaches the server log.
pub const GENERATION_FAILED_MESSAGE: &str = "Failed to generate AI content";

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Rate limiter unavailable")]
    RateLimiterUnavailable,
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!("Rejected request body: {rejection}");
        AppError::Validation(crate::llm_client::gateway::MISSING_PROMPT_MESSAGE.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Generation(msg) => {
                tracing::error!("AI generation failed: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    GENERATION_FAILED_MESSAGE.to_string(),
                )
            }
            AppError::RateLimiterUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Rate limiter unavailable".to_string(),
            ),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
