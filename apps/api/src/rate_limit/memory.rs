use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;

use super::store::{RateLimitRecord, RateLimitStore, StoreError};

/// Process-local counter store.
///
/// `record_hit` runs entirely under the DashMap shard lock for its key, so the
/// lookup, increment and write can't interleave with another handler hitting the
/// same key on a different worker thread.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    records: DashMap<String, RateLimitRecord>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl InMemoryRateLimitStore {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        Ok(self.records.get(key).map(|r| *r))
    }

    async fn put(&self, key: &str, record: RateLimitRecord) -> Result<(), StoreError> {
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        Ok(before.saturating_sub(self.records.len()))
    }

    async fn record_hit(
        &self,
        key: &str,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<RateLimitRecord, StoreError> {
        let mut entry = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::fresh(now, window));
        let updated = entry.hit(now, window);
        *entry = updated;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_record_hit_creates_then_increments() {
        let store = InMemoryRateLimitStore::new();
        let window = TimeDelta::seconds(60);

        let first = store.record_hit("k", window, t(0)).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.window_reset_at, t(60));

        let second = store.record_hit("k", window, t(30)).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(store.get("k").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_records() {
        let store = InMemoryRateLimitStore::new();
        let window = TimeDelta::seconds(60);
        store.record_hit("old", window, t(0)).await.unwrap();
        store.record_hit("new", window, t(50)).await.unwrap();

        let removed = store.sweep_expired(t(60)).await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(store.get("old").await.unwrap(), None);
        assert!(store.get("new").await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_hits_on_one_key_are_all_counted() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let window = TimeDelta::seconds(60);

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    store.record_hit("shared", window, t(1)).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.get("shared").await.unwrap().unwrap().count, 640);
    }
}
