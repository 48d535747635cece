use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::llm_client::gateway::AiGateway;
use crate::rate_limit::RateLimiter;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<AiGateway>,
    pub limiter: RateLimiter,
    pub config: Config,
    /// Root shutdown token. Each AI request runs on a child of it so in-flight
    /// retries stop when the server begins draining.
    pub shutdown: CancellationToken,
}
