//! Storage seam for rate-limit counters.
//!
//! The limiter never touches a map directly; it talks to an `Arc<dyn RateLimitStore>`
//! so a single-process deployment can use [`InMemoryRateLimitStore`] while a
//! horizontally scaled one swaps in [`RedisRateLimitStore`] without changing callers.
//!
//! [`InMemoryRateLimitStore`]: super::memory::InMemoryRateLimitStore
//! [`RedisRateLimitStore`]: super::redis_store::RedisRateLimitStore

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Corrupt rate limit record for '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// One fixed window for one `(route, client)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub count: u32,
    pub window_reset_at: DateTime<Utc>,
}

impl RateLimitRecord {
    /// A fresh, empty window starting at `now`. Saturates at the latest
    /// representable instant instead of overflowing.
    pub fn fresh(now: DateTime<Utc>, window: TimeDelta) -> Self {
        Self {
            count: 0,
            window_reset_at: now
                .checked_add_signed(window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// A request landing exactly on the reset instant already belongs to the next window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_reset_at
    }

    /// Applies one hit: reopen the window if it has lapsed, then count.
    pub fn hit(self, now: DateTime<Utc>, window: TimeDelta) -> Self {
        let mut record = if self.is_expired(now) {
            Self::fresh(now, window)
        } else {
            self
        };
        record.count = record.count.saturating_add(1);
        record
    }
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError>;

    async fn put(&self, key: &str, record: RateLimitRecord) -> Result<(), StoreError>;

    /// Deletes every record whose window has already ended. Returns how many were removed.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Counts one hit against `key` and returns the stored record.
    ///
    /// The default is a plain read-modify-write and is only safe when a single
    /// caller touches a key at a time. Stores shared by concurrent handlers
    /// override it with an operation that is atomic per key.
    async fn record_hit(
        &self,
        key: &str,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<RateLimitRecord, StoreError> {
        let current = self
            .get(key)
            .await?
            .unwrap_or_else(|| RateLimitRecord::fresh(now, window));
        let updated = current.hit(now, window);
        self.put(key, updated).await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_hit_within_window_increments() {
        let window = TimeDelta::seconds(300);
        let record = RateLimitRecord::fresh(t(0), window).hit(t(0), window).hit(t(10), window);
        assert_eq!(record.count, 2);
        assert_eq!(record.window_reset_at, t(300));
    }

    #[test]
    fn test_hit_exactly_at_reset_opens_new_window() {
        let window = TimeDelta::seconds(300);
        let record = RateLimitRecord {
            count: 5,
            window_reset_at: t(300),
        };
        let next = record.hit(t(300), window);
        assert_eq!(next.count, 1);
        assert_eq!(next.window_reset_at, t(600));
    }

    #[test]
    fn test_fresh_window_saturates_instead_of_overflowing() {
        let record = RateLimitRecord::fresh(t(0), TimeDelta::MAX);
        assert_eq!(record.window_reset_at, DateTime::<Utc>::MAX_UTC);
        assert!(!record.is_expired(t(0)));
    }

    #[test]
    fn test_hit_one_instant_before_reset_stays_in_window() {
        let window = TimeDelta::seconds(300);
        let record = RateLimitRecord {
            count: 5,
            window_reset_at: t(300),
        };
        let next = record.hit(t(299), window);
        assert_eq!(next.count, 6);
        assert_eq!(next.window_reset_at, t(300));
    }
}
