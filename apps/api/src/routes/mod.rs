pub mod ai;
pub mod health;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::rate_limit::middleware::{enforce_rate_limit, RouteGuard};
use crate::rate_limit::RateLimitConfig;
use crate::state::AppState;

fn guard(state: &AppState, route: &'static str, config: RateLimitConfig) -> RouteGuard {
    RouteGuard {
        limiter: state.limiter.clone(),
        route,
        config,
        trust_forwarded_for: state.config.trust_forwarded_for,
    }
}

pub fn build_router(state: AppState) -> Router {
    let generate_guard = guard(&state, ai::GENERATE_ROUTE, state.config.generate_limit);
    let optimize_guard = guard(&state, ai::OPTIMIZE_ROUTE, state.config.optimize_limit);

    Router::new()
        .route("/health", get(health::health_handler))
        // AI content (rate limited per route)
        .route(
            "/api/v1/ai/generate",
            post(ai::handle_generate).route_layer(middleware::from_fn_with_state(
                generate_guard,
                enforce_rate_limit,
            )),
        )
        .route(
            "/api/v1/ai/optimize",
            post(ai::handle_optimize).route_layer(middleware::from_fn_with_state(
                optimize_guard,
                enforce_rate_limit,
            )),
        )
        .with_state(state)
}
