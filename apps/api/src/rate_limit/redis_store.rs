//! Redis-backed counter store for deployments running several API instances
//! behind one load balancer. Each record is a hash `{count, reset_at_ms}` that
//! carries a `PEXPIREAT` at its reset instant, so Redis evicts most windows on its
//! own; `sweep_expired` catches anything written without a TTL.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::debug;

use super::store::{RateLimitRecord, RateLimitStore, StoreError};

const SCAN_BATCH: usize = 200;

// KEYS[1] = record key, ARGV[1] = now (ms), ARGV[2] = window (ms).
// Returns {count, reset_at_ms}.
const HIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local reset = tonumber(redis.call('HGET', KEYS[1], 'reset_at_ms'))
if (not reset) or now >= reset then
  reset = now + window
  redis.call('HSET', KEYS[1], 'count', 1, 'reset_at_ms', reset)
  redis.call('PEXPIREAT', KEYS[1], reset)
  return {1, reset}
end
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {count, reset}
"#;

// KEYS[1] = record key, ARGV[1] = now (ms). Returns 1 if the record was deleted.
// Check and delete run as one step so a concurrent HIT_SCRIPT that reopens the
// window is never wiped out.
const SWEEP_SCRIPT: &str = r#"
local reset = tonumber(redis.call('HGET', KEYS[1], 'reset_at_ms'))
if reset and tonumber(ARGV[1]) >= reset then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisRateLimitStore {
    conn: MultiplexedConnection,
    prefix: String,
    hit_script: Script,
    sweep_script: Script,
}

impl RedisRateLimitStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            hit_script: Script::new(HIT_SCRIPT),
            sweep_script: Script::new(SWEEP_SCRIPT),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

fn from_millis(key: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("reset_at_ms {ms} is out of range"),
    })
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();
        let (count, reset): (Option<u32>, Option<i64>) = redis::cmd("HMGET")
            .arg(&redis_key)
            .arg("count")
            .arg("reset_at_ms")
            .query_async(&mut conn)
            .await?;

        match (count, reset) {
            (Some(count), Some(reset)) => Ok(Some(RateLimitRecord {
                count,
                window_reset_at: from_millis(&redis_key, reset)?,
            })),
            (None, None) => Ok(None),
            _ => Err(StoreError::Corrupt {
                key: redis_key,
                reason: "hash is missing a field".to_string(),
            }),
        }
    }

    async fn put(&self, key: &str, record: RateLimitRecord) -> Result<(), StoreError> {
        let redis_key = self.redis_key(key);
        let reset_ms = record.window_reset_at.timestamp_millis();
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&redis_key)
            .arg("count")
            .arg(record.count)
            .arg("reset_at_ms")
            .arg(reset_ms)
            .ignore()
            .cmd("PEXPIREAT")
            .arg(&redis_key)
            .arg(reset_ms)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let now_ms = now.timestamp_millis();
        let pattern = format!("{}:*", self.prefix);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            for redis_key in keys {
                let deleted: usize = self
                    .sweep_script
                    .key(&redis_key)
                    .arg(now_ms)
                    .invoke_async(&mut conn)
                    .await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(removed, "Swept expired Redis rate limit records");
        Ok(removed)
    }

    async fn record_hit(
        &self,
        key: &str,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<RateLimitRecord, StoreError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();
        let (count, reset): (u32, i64) = self
            .hit_script
            .key(&redis_key)
            .arg(now.timestamp_millis())
            .arg(window.num_milliseconds())
            .invoke_async(&mut conn)
            .await?;

        Ok(RateLimitRecord {
            count,
            window_reset_at: from_millis(&redis_key, reset)?,
        })
    }
}
