//! Process-local stand-in for the persistent tier.
//!
//! Used when no Redis URL is configured (single-instance deployments) and in
//! tests. Counter updates happen under one lock, so increments are atomic
//! within the process.

use super::{AttemptOutcome, CacheEntry, CacheStore, RateWindow, Tier, TierStats, WindowStore};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

type WindowKey = (String, String);

#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    windows: Arc<Mutex<HashMap<WindowKey, RateWindow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn bump(
    windows: &mut HashMap<WindowKey, RateWindow>,
    identifier: &str,
    action: &str,
    now: i64,
    window_secs: u64,
) -> RateWindow {
    let window = windows
        .entry((identifier.to_string(), action.to_string()))
        .or_insert_with(|| RateWindow {
            identifier: identifier.to_string(),
            action: action.to_string(),
            attempts: 0,
            window_start: now,
            last_attempt: now,
        });

    if window.is_active(now, window_secs) {
        window.attempts = window.attempts.saturating_add(1);
    } else {
        window.window_start = now;
        window.attempts = 1;
    }
    window.last_attempt = now;

    window.clone()
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn tier(&self) -> Tier {
        Tier::Persistent
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, entry: &CacheEntry) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }

    async fn clear(&self) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let count = entries.len() as u64;
        entries.clear();
        Ok(count)
    }

    async fn purge_expired(&self, now: i64, limit: usize) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .take(limit)
            .map(|entry| entry.key.clone())
            .collect();

        for key in &expired {
            entries.remove(key);
        }
        Ok(expired.len() as u64)
    }

    async fn stats(&self, now: i64) -> Result<TierStats> {
        let entries = self.entries.lock().await;
        Ok(entries.values().fold(TierStats::default(), |mut stats, entry| {
            stats.entries += 1;
            stats.size_bytes += entry.size_bytes();
            if entry.is_expired(now) {
                stats.expired += 1;
            }
            stats
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn fetch_window(&self, identifier: &str, action: &str) -> Result<Option<RateWindow>> {
        let windows = self.windows.lock().await;
        Ok(windows
            .get(&(identifier.to_string(), action.to_string()))
            .cloned())
    }

    async fn record_attempt(
        &self,
        identifier: &str,
        action: &str,
        now: i64,
        window_secs: u64,
    ) -> Result<RateWindow> {
        let mut windows = self.windows.lock().await;
        Ok(bump(&mut windows, identifier, action, now, window_secs))
    }

    async fn try_record(
        &self,
        identifier: &str,
        action: &str,
        now: i64,
        window_secs: u64,
        limit: u32,
    ) -> Result<AttemptOutcome> {
        let mut windows = self.windows.lock().await;
        let key = (identifier.to_string(), action.to_string());
        if let Some(window) = windows.get(&key) {
            if window.is_active(now, window_secs) && window.attempts >= limit {
                return Ok(AttemptOutcome {
                    admitted: false,
                    window: window.clone(),
                });
            }
        }

        Ok(AttemptOutcome {
            admitted: true,
            window: bump(&mut windows, identifier, action, now, window_secs),
        })
    }

    async fn reset_window(&self, identifier: &str, action: &str) -> Result<bool> {
        let mut windows = self.windows.lock().await;
        Ok(windows
            .remove(&(identifier.to_string(), action.to_string()))
            .is_some())
    }

    async fn purge_windows(&self, cutoff: i64, limit: usize) -> Result<u64> {
        let mut windows = self.windows.lock().await;
        let stale: Vec<WindowKey> = windows
            .iter()
            .filter(|(_, window)| window.window_start < cutoff)
            .take(limit)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            windows.remove(key);
        }
        Ok(stale.len() as u64)
    }

    async fn window_count(&self) -> Result<u64> {
        Ok(self.windows.lock().await.len() as u64)
    }
}
