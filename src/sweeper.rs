//! Background garbage collection for expired cache entries and stale
//! rate-limit windows.
//!
//! Runs on a fixed interval in its own task. Every pass is idempotent and
//! bounded by `batch_size` per store, so a large backlog drains over several
//! passes instead of stalling one.

use crate::cache::{CacheManager, TierCounts};
use crate::metrics::MetricsCollector;
use crate::rate_limiter::RateLimiter;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub interval: Duration,
    pub batch_size: usize,
    pub retention: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 500,
            retention: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cache_entries: TierCounts,
    pub rate_windows: u64,
    pub rate_windows_failed: bool,
}

pub struct Sweeper {
    cache: CacheManager,
    limiter: RateLimiter,
    metrics: MetricsCollector,
    settings: SweepSettings,
}

impl Sweeper {
    pub fn new(
        cache: CacheManager,
        limiter: RateLimiter,
        metrics: MetricsCollector,
        settings: SweepSettings,
    ) -> Self {
        Self {
            cache,
            limiter,
            metrics,
            settings,
        }
    }

    /// One pass over both stores. Never fails; problems are logged.
    pub async fn sweep_once(&self) -> SweepReport {
        let cache_entries = self.cache.purge_expired(self.settings.batch_size).await;

        let (rate_windows, rate_windows_failed) = match self
            .limiter
            .purge_stale(self.settings.retention, self.settings.batch_size)
            .await
        {
            Ok(removed) => (removed, false),
            Err(e) => {
                warn!(error = %e, "Rate-limit sweep failed");
                (0, true)
            }
        };

        self.metrics
            .record_sweep(cache_entries.total(), rate_windows);

        let report = SweepReport {
            cache_entries,
            rate_windows,
            rate_windows_failed,
        };
        debug!(?report, "Sweep finished");
        report
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so startup is not
            // slowed by a sweep.
            ticker.tick().await;

            info!(interval = ?self.settings.interval, "Sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::quota::{QuotaPolicy, QuotaTable};
    use crate::storage::{CacheStore, MemoryStore, WindowStore};
    use std::sync::Arc;

    fn build(
        clock: &ManualClock,
        settings: SweepSettings,
    ) -> (Sweeper, CacheManager, RateLimiter, MemoryStore) {
        let store = MemoryStore::new();
        let metrics = MetricsCollector::new();
        let cache = CacheManager::new(Arc::new(store.clone()), Arc::new(clock.clone()))
            .with_metrics(metrics.clone());
        let limiter = RateLimiter::new(
            Arc::new(store.clone()),
            QuotaTable::new().with("login", QuotaPolicy::new(5, 60)),
            Arc::new(clock.clone()),
        )
        .with_metrics(metrics.clone());
        let sweeper = Sweeper::new(cache.clone(), limiter.clone(), metrics, settings);
        (sweeper, cache, limiter, store)
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_state() {
        let clock = ManualClock::default();
        let settings = SweepSettings {
            retention: Duration::from_secs(600),
            ..SweepSettings::default()
        };
        let (sweeper, cache, limiter, store) = build(&clock, settings);

        cache.set("short", &1, Duration::from_secs(10)).await.unwrap();
        cache.set("long", &2, Duration::from_secs(5000)).await.unwrap();
        limiter.record_attempt("login", "old").await;

        clock.advance(601);
        limiter.record_attempt("login", "recent").await;

        let report = sweeper.sweep_once().await;
        assert_eq!(report.cache_entries.persistent, 1);
        assert_eq!(report.rate_windows, 1);
        assert!(!report.rate_windows_failed);

        assert!(CacheStore::get(&store, "long").await.unwrap().is_some());
        assert!(store.fetch_window("recent", "login").await.unwrap().is_some());

        let snapshot = cache.metrics().cache_snapshot();
        assert_eq!(snapshot.sweeps, 1);
        assert_eq!(snapshot.swept_windows, 1);

        // idempotent
        assert_eq!(sweeper.sweep_once().await.cache_entries.total(), 0);
    }

    #[tokio::test]
    async fn test_sweep_is_bounded_by_batch_size() {
        let clock = ManualClock::default();
        let settings = SweepSettings {
            batch_size: 2,
            ..SweepSettings::default()
        };
        let (sweeper, cache, _, _) = build(&clock, settings);
        for i in 0..5 {
            cache.set(&format!("k{}", i), &i, Duration::from_secs(1)).await.unwrap();
        }
        clock.advance(2);

        assert_eq!(sweeper.sweep_once().await.cache_entries.persistent, 2);
        assert_eq!(sweeper.sweep_once().await.cache_entries.persistent, 2);
        assert_eq!(sweeper.sweep_once().await.cache_entries.persistent, 1);
    }

    #[tokio::test]
    async fn test_spawned_sweeper_stops_on_shutdown() {
        let clock = ManualClock::default();
        let settings = SweepSettings {
            interval: Duration::from_millis(10),
            ..SweepSettings::default()
        };
        let (sweeper, cache, _, _) = build(&clock, settings);
        cache.set("gone", &1, Duration::from_secs(1)).await.unwrap();
        clock.advance(5);

        let (tx, rx) = watch::channel(false);
        let handle = sweeper.spawn(rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();

        assert!(cache.metrics().cache_snapshot().sweeps >= 1);
        assert_eq!(cache.stats().await.total_entries, 0);
    }
}
