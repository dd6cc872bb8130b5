//! Dual-tier cache manager
//!
//! Reads try the persistent tier, then the local file tier. A copy is only
//! served while `now < expires_at`; stale copies are deleted on the way past.
//! Writes go to the persistent tier first and are mirrored to the local tier
//! best-effort, so the local copy is there when the persistent tier is not.
//!
//! Local hits are deliberately not written back into the persistent tier: the
//! local tier is a per-host snapshot and must never become the source for
//! shared state.
//!
//! [`CacheManager::remember`] is not single-flight. Concurrent misses on one key
//! each run `populate`, and the last `set` to finish wins.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::storage::{CacheEntry, CacheStore, Tier, TierStats};
use crate::validation::RequestValidator;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_TIER_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub persistent: u64,
    pub local: u64,
}

impl TierCounts {
    pub fn total(&self) -> u64 {
        self.persistent + self.local
    }
}

/// Result of `stats()`. A `None` tier could not be queried.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub persistent: Option<TierStats>,
    pub local: Option<TierStats>,
    pub total_entries: u64,
    pub total_size_bytes: u64,
    pub expired_pending: u64,
}

#[derive(Clone)]
pub struct CacheManager {
    persistent: Arc<dyn CacheStore>,
    local: Option<Arc<dyn CacheStore>>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
    default_ttl: Duration,
    tier_timeout: Duration,
}

impl CacheManager {
    pub fn new(persistent: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            persistent,
            local: None,
            clock,
            metrics: MetricsCollector::new(),
            default_ttl: DEFAULT_TTL,
            tier_timeout: DEFAULT_TIER_TIMEOUT,
        }
    }

    pub fn with_local(mut self, local: Arc<dyn CacheStore>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_tier_timeout(mut self, timeout: Duration) -> Self {
        self.tier_timeout = timeout;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    fn tiers(&self) -> impl Iterator<Item = &Arc<dyn CacheStore>> {
        std::iter::once(&self.persistent).chain(self.local.iter())
    }

    async fn within<T>(&self, tier: Tier, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.tier_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::StoreUnavailable(format!(
                "{} tier timed out after {:?}",
                tier, self.tier_timeout
            ))),
        }
    }

    /// First live copy of `key`, trying tiers in order.
    async fn lookup(&self, key: &str, now: i64) -> Option<(Tier, CacheEntry)> {
        for store in self.tiers() {
            let tier = store.tier();
            match self.within(tier, store.get(key)).await {
                Ok(Some(entry)) if !entry.is_expired(now) => return Some((tier, entry)),
                Ok(Some(entry)) => {
                    debug!(
                        key,
                        %tier,
                        expired_at = entry.expires_at,
                        "Dropping expired cache entry"
                    );
                    if let Err(e) = self.within(tier, store.delete(key)).await {
                        debug!(key, %tier, error = %e, "Lazy delete of expired entry failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.record_tier_error();
                    warn!(key, %tier, error = %e, "Cache tier read failed, falling through");
                }
            }
        }
        None
    }

    /// Cached value for `key`, or `None` on miss, expiry, decode failure or
    /// when no tier can answer.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Err(e) = RequestValidator::validate_cache_key(key) {
            warn!(key, error = %e, "Rejected cache read");
            return None;
        }

        let now = self.clock.now();
        let Some((tier, entry)) = self.lookup(key, now).await else {
            self.metrics.record_miss();
            return None;
        };

        match serde_json::from_str(&entry.value) {
            Ok(value) => {
                match tier {
                    Tier::Persistent => self.metrics.record_persistent_hit(),
                    Tier::Local => self.metrics.record_local_hit(),
                }
                Some(value)
            }
            Err(e) => {
                self.metrics.record_decode_failure();
                self.metrics.record_miss();
                warn!(
                    key,
                    %tier,
                    error = %e,
                    "Cached value could not be decoded, treating as miss"
                );
                None
            }
        }
    }

    /// Store `value` for `ttl` (at least one second).
    ///
    /// Returns whether any tier accepted the write. Tier failures are logged,
    /// never returned; errors are only for unusable input.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<bool> {
        RequestValidator::validate_cache_key(key)?;
        let ttl_secs = ttl.as_secs();
        if ttl_secs == 0 {
            return Err(Error::Validation(
                "Cache TTL must be at least one second".to_string(),
            ));
        }

        let now = self.clock.now();
        let entry = CacheEntry {
            key: key.to_string(),
            value: serde_json::to_string(value)?,
            expires_at: now.saturating_add(ttl_secs.min(i64::MAX as u64) as i64),
            created_at: now,
        };

        let persisted = match self.within(Tier::Persistent, self.persistent.set(&entry)).await {
            Ok(()) => true,
            Err(e) => {
                self.metrics.record_tier_error();
                warn!(key, error = %e, "Persistent cache write failed");
                false
            }
        };

        let mut mirrored = false;
        if let Some(local) = &self.local {
            match self.within(Tier::Local, local.set(&entry)).await {
                Ok(()) => mirrored = true,
                Err(e) => warn!(key, error = %e, "Local cache write failed"),
            }
        }

        Ok(persisted || mirrored)
    }

    pub async fn set_default<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<bool> {
        self.set(key, value, self.default_ttl).await
    }

    /// Remove `key` from every tier. True if any tier held it.
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = false;
        for store in self.tiers() {
            let tier = store.tier();
            match self.within(tier, store.delete(key)).await {
                Ok(hit) => removed |= hit,
                Err(e) => {
                    self.metrics.record_tier_error();
                    warn!(key, %tier, error = %e, "Cache delete failed");
                }
            }
        }
        removed
    }

    /// Empty both tiers. Administrative flush only.
    pub async fn clear(&self) -> TierCounts {
        let mut counts = TierCounts::default();
        for store in self.tiers() {
            let tier = store.tier();
            match self.within(tier, store.clear()).await {
                Ok(removed) => match tier {
                    Tier::Persistent => counts.persistent = removed,
                    Tier::Local => counts.local = removed,
                },
                Err(e) => {
                    self.metrics.record_tier_error();
                    warn!(%tier, error = %e, "Cache clear failed");
                }
            }
        }
        tracing::info!(
            persistent = counts.persistent,
            local = counts.local,
            "Cache flushed"
        );
        counts
    }

    /// Get-or-populate. A `populate` error is returned as-is and nothing is cached.
    pub async fn remember<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        populate: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        self.metrics.record_populate();
        let value = populate().await?;
        if let Err(e) = self.set(key, &value, ttl).await {
            warn!(key, error = %e, "Populated value was not cached");
        }
        Ok(value)
    }

    pub async fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let mut stats = CacheStats {
            persistent: None,
            local: None,
            total_entries: 0,
            total_size_bytes: 0,
            expired_pending: 0,
        };

        for store in self.tiers() {
            let tier = store.tier();
            match self.within(tier, store.stats(now)).await {
                Ok(tier_stats) => {
                    stats.total_entries += tier_stats.entries;
                    stats.total_size_bytes += tier_stats.size_bytes;
                    stats.expired_pending += tier_stats.expired;
                    match tier {
                        Tier::Persistent => stats.persistent = Some(tier_stats),
                        Tier::Local => stats.local = Some(tier_stats),
                    }
                }
                Err(e) => warn!(%tier, error = %e, "Cache stats unavailable"),
            }
        }
        stats
    }

    /// Delete up to `limit` expired entries per tier. Failures are logged.
    pub async fn purge_expired(&self, limit: usize) -> TierCounts {
        let now = self.clock.now();
        let mut counts = TierCounts::default();
        for store in self.tiers() {
            let tier = store.tier();
            match self.within(tier, store.purge_expired(now, limit)).await {
                Ok(removed) => match tier {
                    Tier::Persistent => counts.persistent = removed,
                    Tier::Local => counts.local = removed,
                },
                Err(e) => warn!(%tier, error = %e, "Cache sweep failed"),
            }
        }
        counts
    }

    /// Round-trip latency of one tier; `None` if that tier is not configured.
    pub async fn ping(&self, tier: Tier) -> Option<Result<Duration>> {
        let store = match tier {
            Tier::Persistent => &self.persistent,
            Tier::Local => self.local.as_ref()?,
        };
        let started = Instant::now();
        Some(
            self.within(tier, store.ping())
                .await
                .map(|()| started.elapsed()),
        )
    }
}
