mod config;
mod errors;
mod llm_client;
mod rate_limit;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, StoreBackend};
use crate::llm_client::gateway::AiGateway;
use crate::llm_client::{GeminiClient, GeminiConfig, GenerativeProvider};
use crate::rate_limit::sweeper::Sweeper;
use crate::rate_limit::{InMemoryRateLimitStore, RateLimitStore, RateLimiter, RedisRateLimitStore};
use crate::routes::build_router;
use crate::state::AppState;

const REDIS_KEY_PREFIX: &str = "resume-ai:ratelimit";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails fast on malformed env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Resume AI API v{}", env!("CARGO_PKG_VERSION"));

    // Rate limit store
    let store: Arc<dyn RateLimitStore> = match config.store_backend {
        StoreBackend::Memory => {
            info!("Rate limit store: in-memory");
            Arc::new(InMemoryRateLimitStore::new())
        }
        StoreBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("REDIS_URL is required for the redis rate limit store")?;
            let store = RedisRateLimitStore::connect(url, REDIS_KEY_PREFIX)
                .await
                .context("Failed to connect to Redis")?;
            info!("Rate limit store: redis");
            Arc::new(store)
        }
    };
    let limiter = RateLimiter::new(store, config.failure_policy);
    info!(
        "Rate limits: generate {}/{}s, optimize {}/{}s, failure policy {:?}",
        config.generate_limit.limit(),
        config.generate_limit.window().num_seconds(),
        config.optimize_limit.limit(),
        config.optimize_limit.window().num_seconds(),
        config.failure_policy
    );
    if config.trust_forwarded_for {
        warn!("Trusting X-Forwarded-For for client identity; run behind a proxy that overwrites it");
    }

    let shutdown = CancellationToken::new();
    let sweeper = Sweeper::spawn(limiter.clone(), config.sweep_interval, &shutdown);

    // Initialize LLM provider and gateway
    let provider = GeminiClient::new(GeminiConfig {
        api_key: config.gemini_api_key.clone(),
        model: config.gemini_model.clone(),
        base_url: config.gemini_base_url.clone(),
    })?;
    if provider.is_configured() {
        info!("LLM client initialized (model: {})", provider.model());
    } else {
        warn!("GEMINI_API_KEY is not set; AI routes will fail with 'API key not configured'");
    }
    let gateway = AiGateway::new(
        Arc::new(provider),
        config.ai_max_retries,
        config.ai_backoff_base,
    );

    // Build app state
    let state = AppState {
        gateway: Arc::new(gateway),
        limiter,
        config: config.clone(),
        shutdown: shutdown.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    sweeper.stop().await;
    info!("Shutdown complete");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM and cancels `shutdown` so background work stops.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }

    shutdown.cancel();
}
