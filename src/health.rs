use std::time::SystemTime;
use serde::{Deserialize, Serialize};

use crate::cache::CacheManager;
use crate::storage::Tier;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub persistent: ServiceStatus,
    pub local: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl ServiceStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

/// Pin the instant uptime is measured from. Called once at startup.
pub fn mark_started() {
    std::sync::LazyLock::force(&START_TIME);
}

pub struct HealthChecker {
    cache: CacheManager,
}

impl HealthChecker {
    pub fn new(cache: CacheManager) -> Self {
        Self { cache }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME)
            .unwrap_or_default()
            .as_secs();

        let persistent = self.check_tier(Tier::Persistent).await;
        let local = self.check_tier(Tier::Local).await;

        let overall_status = if persistent.is_healthy() && local.is_healthy() {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            dependencies: DependencyStatus { persistent, local },
        }
    }

    async fn check_tier(&self, tier: Tier) -> ServiceStatus {
        match self.cache.ping(tier).await {
            Some(Ok(latency)) => ServiceStatus {
                status: "healthy".to_string(),
                response_time_ms: latency.as_millis() as u64,
                error: None,
            },
            Some(Err(e)) => ServiceStatus {
                status: "unavailable".to_string(),
                response_time_ms: 0,
                error: Some(e.to_string()),
            },
            None => ServiceStatus {
                status: "unavailable".to_string(),
                response_time_ms: 0,
                error: Some(format!("{} tier not configured", tier)),
            },
        }
    }
}
