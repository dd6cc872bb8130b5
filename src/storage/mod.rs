//! Storage tiers
//!
//! Two contracts sit under the runtime:
//! - [`CacheStore`] holds expiring cache entries. Implemented by the shared
//!   persistent tier (Redis, or memory for single-process use) and by the
//!   per-host file tier.
//! - [`WindowStore`] holds fixed-window rate-limit counters. Only persistent
//!   backends implement it; counters never fall back to the local tier.

pub mod file;
pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use self::file::FileStore;
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Persistent,
    Local,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Persistent => write!(f, "persistent"),
            Tier::Local => write!(f, "local"),
        }
    }
}

/// A cached value as stored by a tier. `value` is the JSON encoding of the
/// caller's payload; tiers never look inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub expires_at: i64,
    pub created_at: i64,
}

impl CacheEntry {
    /// An entry is live strictly before `expires_at`.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn size_bytes(&self) -> u64 {
        (self.key.len() + self.value.len()) as u64
    }
}

/// Fixed-window counter for one (identifier, action) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub identifier: String,
    pub action: String,
    pub attempts: u32,
    pub window_start: i64,
    pub last_attempt: i64,
}

impl RateWindow {
    pub fn is_active(&self, now: i64, window_secs: u64) -> bool {
        now - self.window_start < window_secs as i64
    }

    pub fn resets_at(&self, window_secs: u64) -> i64 {
        self.window_start + window_secs as i64
    }
}

/// Result of [`WindowStore::try_record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub admitted: bool,
    /// The window after the call. Unchanged when the attempt was refused.
    pub window: RateWindow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub entries: u64,
    pub size_bytes: u64,
    pub expired: u64,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    fn tier(&self) -> Tier;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Upsert.
    async fn set(&self, entry: &CacheEntry) -> Result<()>;

    /// Returns whether something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn clear(&self) -> Result<u64>;

    /// Remove at most `limit` entries with `expires_at <= now`.
    async fn purge_expired(&self, now: i64, limit: usize) -> Result<u64>;

    async fn stats(&self, now: i64) -> Result<TierStats>;

    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn fetch_window(&self, identifier: &str, action: &str) -> Result<Option<RateWindow>>;

    /// Atomically count one attempt: increment the active window, or start a
    /// new one at `now` with a single attempt if the old one has elapsed.
    async fn record_attempt(
        &self,
        identifier: &str,
        action: &str,
        now: i64,
        window_secs: u64,
    ) -> Result<RateWindow>;

    /// Count one attempt only while the active window holds fewer than
    /// `limit` attempts. Check and increment are a single atomic step; a
    /// refused attempt leaves the window untouched.
    async fn try_record(
        &self,
        identifier: &str,
        action: &str,
        now: i64,
        window_secs: u64,
        limit: u32,
    ) -> Result<AttemptOutcome>;

    async fn reset_window(&self, identifier: &str, action: &str) -> Result<bool>;

    /// Remove at most `limit` windows that started before `cutoff`.
    async fn purge_windows(&self, cutoff: i64, limit: usize) -> Result<u64>;

    async fn window_count(&self) -> Result<u64>;
}
