//! Redis-backed persistent tier.
//!
//! Layout under the configured prefix:
//! - `{prefix}cache:{key}` hash with `value`, `expires_at`, `created_at`
//! - `{prefix}cache:index` sorted set of cache hash keys scored by `expires_at`
//! - `{prefix}rate:{action}:{identifier}` hash with `identifier`, `action`,
//!   `attempts`, `window_start`, `last_attempt`
//! - `{prefix}rate:index` sorted set of window hash keys scored by `window_start`
//!
//! The indexes exist so the sweeper can find expired state without `SCAN`.
//! Every hash also carries a server-side expiry (`expires_at` for entries,
//! window start plus retention for windows), so a hash that loses its index
//! member still goes away.

use super::{AttemptOutcome, CacheEntry, CacheStore, RateWindow, Tier, TierStats, WindowStore};
use crate::error::{Error, Result};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

// Counts one attempt on KEYS[1]. ARGV[3] is the limit, or -1 for none. A
// refused attempt changes nothing and returns admitted = 0.
const ATTEMPT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local state = redis.call('HMGET', KEYS[1], 'window_start', 'attempts', 'last_attempt')
local start = tonumber(state[1])
local attempts
if start and (now - start) < window then
  attempts = tonumber(state[2]) or 0
  if limit >= 0 and attempts >= limit then
    return {0, attempts, start, tonumber(state[3]) or start}
  end
  attempts = redis.call('HINCRBY', KEYS[1], 'attempts', 1)
else
  start = now
  attempts = 1
  redis.call('HSET', KEYS[1], 'attempts', 1, 'window_start', now,
    'identifier', ARGV[4], 'action', ARGV[5])
end
redis.call('HSET', KEYS[1], 'last_attempt', now)
redis.call('EXPIREAT', KEYS[1], start + tonumber(ARGV[6]))
redis.call('ZADD', KEYS[2], start, KEYS[1])
return {1, attempts, start, now}
"#;

// Deletes every hash named by the index, then the index itself.
const CLEAR_SCRIPT: &str = r#"
local members = redis.call('ZRANGE', KEYS[1], 0, -1)
for i = 1, #members, 500 do
  redis.call('DEL', unpack(members, i, math.min(i + 499, #members)))
end
redis.call('DEL', KEYS[1])
return #members
"#;

// Deletes up to ARGV[2] members of the index scored at or below ARGV[1],
// together with the hashes they name.
const PURGE_SCRIPT: &str = r#"
local members = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(members) do
  redis.call('DEL', member)
  redis.call('ZREM', KEYS[1], member)
end
return #members
"#;

/// Entries sampled by `stats` to estimate the tier size.
const STATS_SAMPLE: isize = 100;

pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    prefix: String,
    window_retention_secs: u64,
}

impl RedisStore {
    /// Opens the client without connecting; the first tier call connects.
    /// A Redis that is down at startup therefore degrades instead of failing boot.
    pub fn new(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            Error::Configuration(format!("Failed to create Redis client: {}", e))
        })?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            prefix: prefix.to_string(),
            window_retention_secs: 86_400,
        })
    }

    /// Server-side lifetime of a window hash, counted from its start. Never
    /// shorter than twice the window itself.
    pub fn with_window_retention(mut self, retention: std::time::Duration) -> Self {
        self.window_retention_secs = retention.as_secs();
        self
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to Redis persistent tier");
                Ok::<_, Error>(manager)
            })
            .await?;
        Ok(conn.clone())
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}cache:{}", self.prefix, key)
    }

    fn cache_index(&self) -> String {
        format!("{}cache:index", self.prefix)
    }

    fn window_key(&self, identifier: &str, action: &str) -> String {
        format!("{}rate:{}:{}", self.prefix, action, identifier)
    }

    fn window_index(&self) -> String {
        format!("{}rate:index", self.prefix)
    }

    fn parse_i64(fields: &HashMap<String, String>, name: &str) -> Result<i64> {
        fields
            .get(name)
            .ok_or_else(|| Error::Serialization(format!("missing field '{}'", name)))?
            .parse()
            .map_err(|e| Error::Serialization(format!("field '{}': {}", name, e)))
    }

    async fn purge_index(&self, index: String, max_score: i64, limit: usize) -> Result<u64> {
        let mut conn = self.connection().await?;
        let removed: u64 = Script::new(PURGE_SCRIPT)
            .key(index)
            .arg(max_score)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn attempt(
        &self,
        identifier: &str,
        action: &str,
        now: i64,
        window_secs: u64,
        limit: Option<u32>,
    ) -> Result<AttemptOutcome> {
        let mut conn = self.connection().await?;
        let ttl = self.window_retention_secs.max(window_secs.saturating_mul(2));
        let (admitted, attempts, window_start, last_attempt): (i64, i64, i64, i64) =
            Script::new(ATTEMPT_SCRIPT)
                .key(self.window_key(identifier, action))
                .key(self.window_index())
                .arg(now)
                .arg(window_secs)
                .arg(limit.map_or(-1, i64::from))
                .arg(identifier)
                .arg(action)
                .arg(ttl)
                .invoke_async(&mut conn)
                .await?;

        Ok(AttemptOutcome {
            admitted: admitted == 1,
            window: RateWindow {
                identifier: identifier.to_string(),
                action: action.to_string(),
                attempts: attempts.max(0) as u32,
                window_start,
                last_attempt,
            },
        })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn tier(&self) -> Tier {
        Tier::Persistent
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.cache_key(key)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let value = fields
            .get("value")
            .cloned()
            .ok_or_else(|| Error::Serialization("missing field 'value'".to_string()))?;

        Ok(Some(CacheEntry {
            key: key.to_string(),
            value,
            expires_at: Self::parse_i64(&fields, "expires_at")?,
            created_at: Self::parse_i64(&fields, "created_at")?,
        }))
    }

    async fn set(&self, entry: &CacheEntry) -> Result<()> {
        let mut conn = self.connection().await?;
        let hash_key = self.cache_key(&entry.key);

        ::redis::pipe()
            .atomic()
            .del(&hash_key)
            .ignore()
            .hset_multiple(
                &hash_key,
                &[
                    ("value", entry.value.clone()),
                    ("expires_at", entry.expires_at.to_string()),
                    ("created_at", entry.created_at.to_string()),
                ],
            )
            .ignore()
            .cmd("EXPIREAT")
            .arg(&hash_key)
            .arg(entry.expires_at)
            .ignore()
            .zadd(self.cache_index(), &hash_key, entry.expires_at)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let hash_key = self.cache_key(key);

        let (deleted, _): (i64, i64) = ::redis::pipe()
            .atomic()
            .del(&hash_key)
            .zrem(self.cache_index(), &hash_key)
            .query_async(&mut conn)
            .await?;

        Ok(deleted > 0)
    }

    async fn clear(&self) -> Result<u64> {
        let mut conn = self.connection().await?;
        let removed: u64 = Script::new(CLEAR_SCRIPT)
            .key(self.cache_index())
            .invoke_async(&mut conn)
            .await?;

        debug!(count = removed, "Cleared persistent cache tier");
        Ok(removed)
    }

    async fn purge_expired(&self, now: i64, limit: usize) -> Result<u64> {
        self.purge_index(self.cache_index(), now, limit).await
    }

    /// `size_bytes` is extrapolated from the first entries of the index.
    async fn stats(&self, now: i64) -> Result<TierStats> {
        let mut conn = self.connection().await?;
        let index = self.cache_index();

        let entries: u64 = conn.zcard(&index).await?;
        let expired: u64 = conn.zcount(&index, "-inf", now).await?;
        let sample: Vec<String> = conn.zrange(&index, 0, STATS_SAMPLE - 1).await?;

        let mut size_bytes = 0u64;
        if !sample.is_empty() {
            let mut pipe = ::redis::pipe();
            for member in &sample {
                pipe.cmd("HSTRLEN").arg(member).arg("value");
            }
            let lengths: Vec<u64> = pipe.query_async(&mut conn).await?;
            let key_overhead = self.cache_key("").len();
            let sampled = lengths.iter().sum::<u64>()
                + sample
                    .iter()
                    .map(|m| m.len().saturating_sub(key_overhead) as u64)
                    .sum::<u64>();
            size_bytes = sampled * entries / sample.len() as u64;
        }

        Ok(TierStats {
            entries,
            size_bytes,
            expired,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn fetch_window(&self, identifier: &str, action: &str) -> Result<Option<RateWindow>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> =
            conn.hgetall(self.window_key(identifier, action)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(RateWindow {
            identifier: identifier.to_string(),
            action: action.to_string(),
            attempts: Self::parse_i64(&fields, "attempts")?.max(0) as u32,
            window_start: Self::parse_i64(&fields, "window_start")?,
            last_attempt: Self::parse_i64(&fields, "last_attempt")?,
        }))
    }

    async fn record_attempt(
        &self,
        identifier: &str,
        action: &str,
        now: i64,
        window_secs: u64,
    ) -> Result<RateWindow> {
        let outcome = self
            .attempt(identifier, action, now, window_secs, None)
            .await?;
        Ok(outcome.window)
    }

    async fn try_record(
        &self,
        identifier: &str,
        action: &str,
        now: i64,
        window_secs: u64,
        limit: u32,
    ) -> Result<AttemptOutcome> {
        self.attempt(identifier, action, now, window_secs, Some(limit))
            .await
    }

    async fn reset_window(&self, identifier: &str, action: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let key = self.window_key(identifier, action);

        let (deleted, _): (i64, i64) = ::redis::pipe()
            .atomic()
            .del(&key)
            .zrem(self.window_index(), &key)
            .query_async(&mut conn)
            .await?;

        Ok(deleted > 0)
    }

    async fn purge_windows(&self, cutoff: i64, limit: usize) -> Result<u64> {
        // Index scores are inclusive; windows strictly before the cutoff go.
        self.purge_index(self.window_index(), cutoff - 1, limit).await
    }

    async fn window_count(&self) -> Result<u64> {
        let mut conn = self.connection().await?;
        let count: u64 = conn.zcard(self.window_index()).await?;
        Ok(count)
    }
}
