use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::{CacheStats, TierCounts};
use crate::rate_limiter::QuotaStatus;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub timestamp: u64,
    pub persistent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ReadyResponse {
    /// The runtime is always ready: a missing persistent tier only degrades it.
    pub fn ready(persistent_connected: bool) -> Self {
        Self {
            status: "ready".to_string(),
            timestamp: unix_now(),
            persistent: if persistent_connected { "connected" } else { "disconnected" }.to_string(),
            note: (!persistent_connected).then(|| "Running on the local tier only".to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub timestamp: u64,
    #[serde(flatten)]
    pub stats: CacheStats,
    /// Live rate-limit windows; `None` when the store could not be asked.
    pub rate_windows: Option<u64>,
}

impl CacheStatsResponse {
    pub fn new(stats: CacheStats, rate_windows: Option<u64>) -> Self {
        Self {
            timestamp: unix_now(),
            stats,
            rate_windows,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub status: String,
    pub removed: TierCounts,
}

impl FlushResponse {
    pub fn flushed(removed: TierCounts) -> Self {
        Self {
            status: "flushed".to_string(),
            removed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub key: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct RateLimitStatusResponse {
    pub timestamp: u64,
    #[serde(flatten)]
    pub status: QuotaStatus,
}

impl From<QuotaStatus> for RateLimitStatusResponse {
    fn from(status: QuotaStatus) -> Self {
        Self {
            timestamp: unix_now(),
            status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub action: String,
    pub identifier: String,
    pub reset: bool,
}
