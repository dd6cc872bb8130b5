use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMetrics {
    pub allowed: u64,
    pub denied: u64,
    pub failed_open: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    persistent_hits: AtomicU64,
    local_hits: AtomicU64,
    misses: AtomicU64,
    decode_failures: AtomicU64,
    tier_errors: AtomicU64,
    populate_calls: AtomicU64,
    sweeps: AtomicU64,
    swept_entries: AtomicU64,
    swept_windows: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetricsSnapshot {
    pub persistent_hits: u64,
    pub local_hits: u64,
    pub misses: u64,
    pub decode_failures: u64,
    pub tier_errors: u64,
    pub populate_calls: u64,
    pub sweeps: u64,
    pub swept_entries: u64,
    pub swept_windows: u64,
}

impl CacheMetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.persistent_hits + self.local_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cache: CacheMetricsSnapshot,
    pub hit_rate: f64,
    pub actions: HashMap<String, ActionMetrics>,
}

/// Shared counters for the runtime. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    cache: Arc<CacheCounters>,
    actions: Arc<RwLock<HashMap<String, ActionMetrics>>>,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_persistent_hit(&self) {
        bump(&self.cache.persistent_hits, 1);
    }

    pub fn record_local_hit(&self) {
        bump(&self.cache.local_hits, 1);
    }

    pub fn record_miss(&self) {
        bump(&self.cache.misses, 1);
    }

    pub fn record_decode_failure(&self) {
        bump(&self.cache.decode_failures, 1);
    }

    pub fn record_tier_error(&self) {
        bump(&self.cache.tier_errors, 1);
    }

    pub fn record_populate(&self) {
        bump(&self.cache.populate_calls, 1);
    }

    pub fn record_sweep(&self, entries: u64, windows: u64) {
        bump(&self.cache.sweeps, 1);
        bump(&self.cache.swept_entries, entries);
        bump(&self.cache.swept_windows, windows);
    }

    pub async fn record_decision(&self, action: &str, allowed: bool) {
        let mut actions = self.actions.write().await;
        let metrics = actions.entry(action.to_string()).or_default();
        if allowed {
            metrics.allowed += 1;
        } else {
            metrics.denied += 1;
        }
    }

    pub async fn record_fail_open(&self, action: &str) {
        let mut actions = self.actions.write().await;
        actions.entry(action.to_string()).or_default().failed_open += 1;
    }

    pub async fn get_action_metrics(&self, action: &str) -> Option<ActionMetrics> {
        self.actions.read().await.get(action).cloned()
    }

    pub fn cache_snapshot(&self) -> CacheMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheMetricsSnapshot {
            persistent_hits: load(&self.cache.persistent_hits),
            local_hits: load(&self.cache.local_hits),
            misses: load(&self.cache.misses),
            decode_failures: load(&self.cache.decode_failures),
            tier_errors: load(&self.cache.tier_errors),
            populate_calls: load(&self.cache.populate_calls),
            sweeps: load(&self.cache.sweeps),
            swept_entries: load(&self.cache.swept_entries),
            swept_windows: load(&self.cache.swept_windows),
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let cache = self.cache_snapshot();
        MetricsSnapshot {
            hit_rate: cache.hit_rate(),
            cache,
            actions: self.actions.read().await.clone(),
        }
    }
}
