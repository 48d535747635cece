//! Axum middleware that enforces a route's quota before its handler runs.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::warn;

use super::{LimiterOutcome, RateLimitConfig, RateLimitDecision, RateLimiter, ANONYMOUS_KEY};
use crate::errors::AppError;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Middleware state for one rate-limited route.
#[derive(Clone)]
pub struct RouteGuard {
    pub limiter: RateLimiter,
    pub route: &'static str,
    pub config: RateLimitConfig,
    /// Whether `X-Forwarded-For` / `X-Real-IP` identify the client. Only safe
    /// behind a proxy that overwrites them.
    pub trust_forwarded_for: bool,
}

pub async fn enforce_rate_limit(
    State(guard): State<RouteGuard>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request, guard.trust_forwarded_for);

    match guard.limiter.check(guard.route, &key, &guard.config).await {
        LimiterOutcome::Allowed(decision) => {
            let mut response = next.run(request).await;
            apply_headers(response.headers_mut(), &decision);
            response
        }
        LimiterOutcome::Bypassed => next.run(request).await,
        LimiterOutcome::Rejected(decision) => {
            let wait_secs = decision.retry_after_secs(Utc::now());
            warn!(route = guard.route, key = %key, wait_secs, "Rate limit exceeded");
            rejection_response(&decision, wait_secs)
        }
        LimiterOutcome::Unavailable => AppError::RateLimiterUnavailable.into_response(),
    }
}

/// Derives the client identifier: proxy headers when trusted, otherwise the
/// socket peer, otherwise the shared anonymous bucket.
pub fn client_key(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        if let Some(ip) = forwarded_ip(request.headers()) {
            return ip;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS_KEY.to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(HEADER_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(HEADER_RESET, HeaderValue::from(decision.reset_epoch_secs()));
}

fn rejection_response(decision: &RateLimitDecision, wait_secs: i64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "Too many requests",
            "message": format!("Please wait {wait_secs} seconds before trying again."),
        })),
    )
        .into_response();

    let headers = response.headers_mut();
    apply_headers(headers, decision);
    headers.insert(header::RETRY_AFTER, HeaderValue::from(wait_secs));
    response
}
