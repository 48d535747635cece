use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::llm_client::gateway::{DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES};
use crate::rate_limit::{FailurePolicy, RateLimitConfig};

/// Which backing store holds rate-limit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => bail!("unknown rate limit store '{other}' (expected 'memory' or 'redis')"),
        }
    }
}

/// Application configuration loaded from environment variables.
/// Only `REDIS_URL` is conditionally required; everything else has a default.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub rust_log: String,
    /// Provider key. `None` makes every generation call fail fast with
    /// "API key not configured".
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub ai_max_retries: u32,
    pub ai_backoff_base: Duration,
    pub ai_request_timeout: Duration,
    pub generate_limit: RateLimitConfig,
    pub optimize_limit: RateLimitConfig,
    pub sweep_interval: Duration,
    pub failure_policy: FailurePolicy,
    pub store_backend: StoreBackend,
    pub redis_url: Option<String>,
    pub trust_forwarded_for: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let store_backend: StoreBackend = env_or("RATE_LIMIT_STORE", StoreBackend::Memory)?;
        let redis_url = optional_env("REDIS_URL");
        if store_backend == StoreBackend::Redis && redis_url.is_none() {
            bail!("RATE_LIMIT_STORE=redis requires REDIS_URL to be set");
        }

        Ok(Config {
            port: env_or("PORT", 8080u16).context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            gemini_api_key: optional_env("GEMINI_API_KEY"),
            gemini_model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| "gemini-1.5-flash".to_string()),
            gemini_base_url: std::env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string()),
            ai_max_retries: env_or("AI_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            ai_backoff_base: Duration::from_millis(env_or(
                "AI_BACKOFF_BASE_MS",
                DEFAULT_BACKOFF_BASE.as_millis() as u64,
            )?),
            ai_request_timeout: Duration::from_secs(env_or("AI_REQUEST_TIMEOUT_SECS", 60u64)?),
            generate_limit: route_limit("RATE_LIMIT_GENERATE")?,
            optimize_limit: route_limit("RATE_LIMIT_OPTIMIZE")?,
            sweep_interval: sweep_interval(env_or("RATE_LIMIT_SWEEP_INTERVAL_SECS", 300u64)?)?,
            failure_policy: env_or("RATE_LIMIT_FAILURE_POLICY", FailurePolicy::Open)?,
            store_backend,
            redis_url,
            trust_forwarded_for: env_or("TRUST_FORWARDED_FOR", false)?,
        })
    }
}

/// Reads `{prefix}_LIMIT` and `{prefix}_WINDOW_SECS`, defaulting to 5 per 300s.
fn route_limit(prefix: &str) -> Result<RateLimitConfig> {
    let limit = env_or(&format!("{prefix}_LIMIT"), 5u32)?;
    let window = env_or(&format!("{prefix}_WINDOW_SECS"), 300u64)?;
    RateLimitConfig::new(limit, Duration::from_secs(window))
        .with_context(|| format!("invalid rate limit for {prefix}"))
}

/// `tokio::time::interval` panics on a zero period, so reject it here.
fn sweep_interval(secs: u64) -> Result<Duration> {
    if secs == 0 {
        bail!("RATE_LIMIT_SWEEP_INTERVAL_SECS must be a positive number of seconds");
    }
    Ok(Duration::from_secs(secs))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("environment variable '{key}' is invalid: {e}")),
        None => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Defaults as if no environment variables were set, with a provider key present.
    pub fn for_tests() -> Self {
        Config {
            port: 0,
            rust_log: "debug".to_string(),
            gemini_api_key: Some("test-key".to_string()),
            gemini_model: "gemini-1.5-flash".to_string(),
            gemini_base_url: "http://127.0.0.1:1".to_string(),
            ai_max_retries: DEFAULT_MAX_RETRIES,
            ai_backoff_base: DEFAULT_BACKOFF_BASE,
            ai_request_timeout: Duration::from_secs(60),
            generate_limit: RateLimitConfig::new(5, Duration::from_secs(300)).unwrap(),
            optimize_limit: RateLimitConfig::new(5, Duration::from_secs(300)).unwrap(),
            sweep_interval: Duration::from_secs(300),
            failure_policy: FailurePolicy::Open,
            store_backend: StoreBackend::Memory,
            redis_url: None,
            trust_forwarded_for: true,
        }
    }
}
