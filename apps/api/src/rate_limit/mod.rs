//! Fixed-window rate limiting for the AI routes.
//!
//! Each `(route, client)` pair gets its own counter. A request opens a window on
//! first sight, counts against it until `window_reset_at`, and is rejected once
//! the count passes the route's limit. Records live behind [`RateLimitStore`];
//! a [`sweeper::Sweeper`] task clears out windows nobody came back for.

pub mod memory;
pub mod middleware;
pub mod redis_store;
pub mod store;
pub mod sweeper;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, warn};

pub use memory::InMemoryRateLimitStore;
pub use redis_store::RedisRateLimitStore;
pub use store::{RateLimitRecord, RateLimitStore, StoreError};

/// Key used when no client identifier can be derived from the request.
pub const ANONYMOUS_KEY: &str = "anonymous";

/// Longest window a route may configure.
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Per-route quota: `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    limit: u32,
    window: TimeDelta,
}

impl RateLimitConfig {
    pub fn new(limit: u32, window: Duration) -> anyhow::Result<Self> {
        if limit == 0 {
            bail!("rate limit must be a positive integer");
        }
        if window.is_zero() {
            bail!("rate limit window must be positive");
        }
        if window > MAX_WINDOW {
            bail!(
                "rate limit window of {}s exceeds the maximum of {}s",
                window.as_secs(),
                MAX_WINDOW.as_secs()
            );
        }
        let window = TimeDelta::from_std(window).context("rate limit window is too large")?;
        Ok(Self { limit, window })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> TimeDelta {
        self.window
    }
}

/// What to do when the counter store itself fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Let the request through unprotected.
    #[default]
    Open,
    /// Refuse the request.
    Closed,
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailurePolicy::Open),
            "closed" => Ok(FailurePolicy::Closed),
            other => bail!("unknown failure policy '{other}' (expected 'open' or 'closed')"),
        }
    }
}

/// Quota snapshot after counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    /// `limit - count`, floored at zero. The record may briefly hold `limit + 1`.
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    fn from_record(record: RateLimitRecord, config: &RateLimitConfig) -> Self {
        Self {
            allowed: record.count <= config.limit,
            limit: config.limit,
            remaining: config.limit.saturating_sub(record.count),
            reset_at: record.window_reset_at,
        }
    }

    /// Reset instant in whole seconds since the epoch, rounded up.
    pub fn reset_epoch_secs(&self) -> i64 {
        (self.reset_at.timestamp_millis() + 999).div_euclid(1000)
    }

    /// Seconds the client should wait, `ceil((reset_at - now) / 1s)`.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> i64 {
        let ms = (self.reset_at - now).num_milliseconds().max(0);
        (ms + 999) / 1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterOutcome {
    Allowed(RateLimitDecision),
    Rejected(RateLimitDecision),
    /// The store failed and the policy is fail-open.
    Bypassed,
    /// The store failed and the policy is fail-closed.
    Unavailable,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    failure_policy: FailurePolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, failure_policy: FailurePolicy) -> Self {
        Self {
            store,
            failure_policy,
        }
    }

    pub async fn check(
        &self,
        route: &str,
        client_key: &str,
        config: &RateLimitConfig,
    ) -> LimiterOutcome {
        self.check_at(route, client_key, config, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        route: &str,
        client_key: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> LimiterOutcome {
        let key = store_key(route, client_key);
        match self.store.record_hit(&key, config.window, now).await {
            Ok(record) => {
                let decision = RateLimitDecision::from_record(record, config);
                if decision.allowed {
                    LimiterOutcome::Allowed(decision)
                } else {
                    LimiterOutcome::Rejected(decision)
                }
            }
            Err(e) => match self.failure_policy {
                FailurePolicy::Open => {
                    warn!(route, key = %client_key, error = %e, "Rate limiter failed; allowing request");
                    LimiterOutcome::Bypassed
                }
                FailurePolicy::Closed => {
                    error!(route, key = %client_key, error = %e, "Rate limiter failed; rejecting request");
                    LimiterOutcome::Unavailable
                }
            },
        }
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.store.sweep_expired(now).await
    }
}

fn store_key(route: &str, client_key: &str) -> String {
    let client_key = if client_key.trim().is_empty() {
        ANONYMOUS_KEY
    } else {
        client_key
    };
    format!("{route}:{client_key}")
}


#[cfg(test)]
mod tests {
    use super::testing::FailingStore;
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn limiter() -> (RateLimiter, Arc<InMemoryRateLimitStore>) {
        let store = Arc::new(InMemoryRateLimitStore::new());
        (RateLimiter::new(store.clone(), FailurePolicy::Open), store)
    }

    fn five_per_five_minutes() -> RateLimitConfig {
        RateLimitConfig::new(5, Duration::from_secs(300)).unwrap()
    }

    fn decision(outcome: LimiterOutcome) -> RateLimitDecision {
        match outcome {
            LimiterOutcome::Allowed(d) | LimiterOutcome::Rejected(d) => d,
            other => panic!("expected a decision, got {other:?}"),
        }
    }

    #[test]
    fn test_config_rejects_zero_values() {
        assert!(RateLimitConfig::new(0, Duration::from_secs(60)).is_err());
        assert!(RateLimitConfig::new(5, Duration::ZERO).is_err());
    }

    #[test]
    fn test_config_caps_window_length() {
        assert!(RateLimitConfig::new(5, Duration::from_secs(1_000_000_000_000_000)).is_err());
        assert!(RateLimitConfig::new(5, MAX_WINDOW + Duration::from_secs(1)).is_err());
        let cfg = RateLimitConfig::new(5, MAX_WINDOW).unwrap();
        assert_eq!(cfg.window(), TimeDelta::days(365));
    }

    #[test]
    fn test_failure_policy_parses() {
        assert_eq!("OPEN".parse::<FailurePolicy>().unwrap(), FailurePolicy::Open);
        assert_eq!("closed".parse::<FailurePolicy>().unwrap(), FailurePolicy::Closed);
        assert!("maybe".parse::<FailurePolicy>().is_err());
    }

    #[tokio::test]
    async fn test_exactly_limit_requests_pass_and_remaining_counts_down() {
        let (limiter, _) = limiter();
        let cfg = five_per_five_minutes();

        for i in 1..=5u32 {
            let outcome = limiter.check_at("ai-generate", "1.2.3.4", &cfg, t(i as i64)).await;
            assert!(matches!(outcome, LimiterOutcome::Allowed(_)), "request {i}");
            assert_eq!(decision(outcome).remaining, 5 - i);
        }
    }

    #[tokio::test]
    async fn test_limit_plus_one_is_rejected_with_zero_remaining() {
        let (limiter, store) = limiter();
        let cfg = five_per_five_minutes();
        for _ in 0..5 {
            limiter.check_at("ai-generate", "1.2.3.4", &cfg, t(0)).await;
        }

        let outcome = limiter.check_at("ai-generate", "1.2.3.4", &cfg, t(10)).await;

        let LimiterOutcome::Rejected(d) = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert_eq!(d.remaining, 0);
        assert_eq!(d.limit, 5);
        assert_eq!(d.retry_after_secs(t(10)), 290);
        let stored = store.get("ai-generate:1.2.3.4").await.unwrap().unwrap();
        assert_eq!(stored.count, 6);
    }

    #[tokio::test]
    async fn test_request_after_window_resets_count() {
        let (limiter, _) = limiter();
        let cfg = five_per_five_minutes();
        for _ in 0..6 {
            limiter.check_at("ai-generate", "k", &cfg, t(0)).await;
        }

        let outcome = limiter.check_at("ai-generate", "k", &cfg, t(300)).await;

        let LimiterOutcome::Allowed(d) = outcome else {
            panic!("expected a fresh window, got {outcome:?}");
        };
        assert_eq!(d.remaining, 4);
        assert_eq!(d.reset_at, t(600));
    }

    #[tokio::test]
    async fn test_keys_do_not_interfere() {
        let (limiter, _) = limiter();
        let cfg = five_per_five_minutes();
        for _ in 0..6 {
            limiter.check_at("ai-generate", "a", &cfg, t(0)).await;
        }

        let outcome = limiter.check_at("ai-generate", "b", &cfg, t(1)).await;
        assert!(matches!(outcome, LimiterOutcome::Allowed(d) if d.remaining == 4));
    }

    #[tokio::test]
    async fn test_routes_do_not_share_counters() {
        let (limiter, _) = limiter();
        let cfg = five_per_five_minutes();
        for _ in 0..6 {
            limiter.check_at("ai-generate", "a", &cfg, t(0)).await;
        }

        let outcome = limiter.check_at("ai-optimize", "a", &cfg, t(1)).await;
        assert!(matches!(outcome, LimiterOutcome::Allowed(_)));
    }

    #[tokio::test]
    async fn test_blank_key_falls_into_anonymous_bucket() {
        let (limiter, store) = limiter();
        let cfg = five_per_five_minutes();
        limiter.check_at("ai-generate", "  ", &cfg, t(0)).await;
        assert!(store.get("ai-generate:anonymous").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_key() {
        let (limiter, store) = limiter();
        let cfg = five_per_five_minutes();
        limiter.check_at("ai-generate", "k", &cfg, t(0)).await;

        let removed = limiter.sweep_expired(t(301)).await.unwrap();

        assert_eq!(removed, 1);
        assert!(store.get("ai-generate:k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_by_default() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), FailurePolicy::default());
        let outcome = limiter.check_at("ai-generate", "k", &five_per_five_minutes(), t(0)).await;
        assert_eq!(outcome, LimiterOutcome::Bypassed);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed_when_configured() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), FailurePolicy::Closed);
        let outcome = limiter.check_at("ai-generate", "k", &five_per_five_minutes(), t(0)).await;
        assert_eq!(outcome, LimiterOutcome::Unavailable);
    }

    #[test]
    fn test_retry_after_rounds_up_partial_seconds() {
        let d = RateLimitDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: t(10) + TimeDelta::milliseconds(1),
        };
        assert_eq!(d.retry_after_secs(t(0)), 11);
        assert_eq!(d.retry_after_secs(t(20)), 0);
        assert_eq!(d.reset_epoch_secs(), 1_700_000_011);
    }
}
