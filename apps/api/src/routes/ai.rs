//! Axum route handlers for the AI content endpoints.
//!
//! Both routes share one contract, `{ prompt } -> { content }`, and differ only
//! in which rate-limit bucket guards them. Prompt wording is built by the client.

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::errors::AppError;
use crate::llm_client::gateway::{GatewayError, MISSING_PROMPT_MESSAGE};
use crate::state::AppState;

pub const GENERATE_ROUTE: &str = "ai-generate";
pub const OPTIMIZE_ROUTE: &str = "ai-optimize";

#[derive(Debug, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct GenerationResponse {
    pub content: String,
}

/// POST /api/v1/ai/generate
///
/// Drafts new resume text (summaries, bullets, descriptions) from a prompt.
pub async fn handle_generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, AppError> {
    let Json(request) = payload?;
    run_generation(&state, GENERATE_ROUTE, &request.prompt).await
}

/// POST /api/v1/ai/optimize
///
/// Rewrites existing resume text against a pasted job description.
pub async fn handle_optimize(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, AppError> {
    let Json(request) = payload?;
    run_generation(&state, OPTIMIZE_ROUTE, &request.prompt).await
}

async fn run_generation(
    state: &AppState,
    route: &'static str,
    prompt: &str,
) -> Result<Json<GenerationResponse>, AppError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("ai_generation", %request_id, route);

    async move {
        let cancel = state.shutdown.child_token();
        // Cancels any pending backoff if this future is dropped (timeout or client gone).
        let _cancel_on_drop = cancel.clone().drop_guard();

        let timeout = state.config.ai_request_timeout;
        let outcome = tokio::time::timeout(timeout, state.gateway.generate(prompt, &cancel)).await;

        match outcome {
            Ok(Ok(content)) => {
                info!(chars = content.len(), "AI content generated");
                Ok(Json(GenerationResponse { content }))
            }
            Ok(Err(GatewayError::MissingPrompt)) => {
                Err(AppError::Validation(MISSING_PROMPT_MESSAGE.to_string()))
            }
            Ok(Err(GatewayError::Exhausted { attempts, message })) => Err(AppError::Generation(
                format!("{message} (after {attempts} attempts)"),
            )),
            Ok(Err(e)) => Err(AppError::Generation(e.to_string())),
            Err(_) => Err(AppError::Generation(format!(
                "request timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }
    .instrument(span)
    .await
}
