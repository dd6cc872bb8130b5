//! Fixed-window rate limiter.
//!
//! Each (identifier, action) pair owns one counter. While
//! `now - window_start < window` attempts accumulate; the first attempt after
//! that starts a new window at `now` with one attempt. Bursts of up to twice
//! the limit are possible across a window boundary.
//!
//! Every failure on the storage side fails open: the limiter protects the site,
//! it must not take it down.

use crate::clock::Clock;
use crate::error::{Error, QuotaDenial, Result};
use crate::metrics::MetricsCollector;
use crate::quota::{QuotaPolicy, QuotaTable};
use crate::storage::{RateWindow, WindowStore};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIER_TIMEOUT: Duration = Duration::from_millis(250);

/// Outcome of a successful [`RateLimiter::enforce`]. Quota fields are `None`
/// when the action has no policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub action: String,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub action: String,
    pub identifier: String,
    pub limit: u32,
    pub window_secs: u64,
    pub attempts: u32,
    pub remaining: u32,
    pub reset_at: Option<i64>,
    pub allowed: bool,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    quotas: Arc<QuotaTable>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
    tier_timeout: Duration,
    unknown_actions: Arc<Mutex<HashSet<String>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, quotas: QuotaTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            quotas: Arc::new(quotas),
            clock,
            metrics: MetricsCollector::new(),
            tier_timeout: DEFAULT_TIER_TIMEOUT,
            unknown_actions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_tier_timeout(mut self, timeout: Duration) -> Self {
        self.tier_timeout = timeout;
        self
    }

    pub fn quotas(&self) -> &QuotaTable {
        &self.quotas
    }

    /// Policy for `action`. Unknown actions are logged once and not limited.
    fn policy(&self, action: &str) -> Option<QuotaPolicy> {
        let policy = self.quotas.get(action).copied();
        if policy.is_none() {
            let first_time = self
                .unknown_actions
                .lock()
                .map(|mut seen| seen.insert(action.to_string()))
                .unwrap_or(false);
            if first_time {
                let err = Error::Configuration(format!("no quota policy for action '{}'", action));
                warn!(action, error = %err, "Unknown rate-limit action, allowing");
            }
        }
        policy
    }

    async fn within<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.tier_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(Error::StoreUnavailable(format!(
                    "rate-limit store timed out after {:?}",
                    self.tier_timeout
                )))
            })
    }

    /// Window that still counts at `now`, if any.
    async fn active_window(
        &self,
        action: &str,
        identifier: &str,
        policy: &QuotaPolicy,
        now: i64,
    ) -> Result<Option<RateWindow>> {
        let window = self
            .within(self.store.fetch_window(identifier, action))
            .await?;
        Ok(window.filter(|w| w.is_active(now, policy.window_secs())))
    }

    /// Like `active_window`, but store failures read as "no window".
    async fn active_window_or_open(
        &self,
        action: &str,
        identifier: &str,
        policy: &QuotaPolicy,
        now: i64,
    ) -> Option<RateWindow> {
        match self.active_window(action, identifier, policy, now).await {
            Ok(window) => window,
            Err(e) => {
                self.metrics.record_fail_open(action).await;
                warn!(action, error = %e, "Rate-limit store unavailable, failing open");
                None
            }
        }
    }

    async fn record(
        &self,
        action: &str,
        identifier: &str,
        policy: &QuotaPolicy,
        now: i64,
    ) -> Option<RateWindow> {
        match self
            .within(
                self.store
                    .record_attempt(identifier, action, now, policy.window_secs()),
            )
            .await
        {
            Ok(window) => {
                debug!(action, attempts = window.attempts, "Recorded attempt");
                Some(window)
            }
            Err(e) => {
                self.metrics.record_fail_open(action).await;
                warn!(action, error = %e, "Failed to record rate-limit attempt");
                None
            }
        }
    }

    /// Read-only: would one more attempt be within the quota right now?
    pub async fn is_allowed(&self, action: &str, identifier: &str) -> bool {
        let Some(policy) = self.policy(action) else {
            return true;
        };
        let now = self.clock.now();
        self.active_window_or_open(action, identifier, &policy, now)
            .await
            .map_or(true, |window| window.attempts < policy.limit)
    }

    /// Count one attempt. `None` for unknown actions or when the store is down.
    pub async fn record_attempt(&self, action: &str, identifier: &str) -> Option<RateWindow> {
        let policy = self.policy(action)?;
        let now = self.clock.now();
        self.record(action, identifier, &policy, now).await
    }

    /// Attempts left in the current window; `None` when the action is unlimited.
    pub async fn remaining(&self, action: &str, identifier: &str) -> Option<u32> {
        let policy = self.policy(action)?;
        let now = self.clock.now();
        let used = self
            .active_window_or_open(action, identifier, &policy, now)
            .await
            .map_or(0, |window| window.attempts);
        Some(policy.limit.saturating_sub(used))
    }

    /// Epoch second at which the current window ends, if one is running.
    pub async fn reset_time(&self, action: &str, identifier: &str) -> Option<i64> {
        let policy = self.policy(action)?;
        let now = self.clock.now();
        self.active_window_or_open(action, identifier, &policy, now)
            .await
            .map(|window| window.resets_at(policy.window_secs()))
    }

    /// Seconds until the current window ends, 0 if none is running.
    pub async fn retry_after(&self, action: &str, identifier: &str) -> u64 {
        let now = self.clock.now();
        self.reset_time(action, identifier)
            .await
            .map_or(0, |reset_at| (reset_at - now).max(0) as u64)
    }

    /// Gate an attempt.
    ///
    /// Check and increment happen in one atomic store call, so concurrent
    /// callers never get past the limit together. A denied attempt is not
    /// recorded and comes back as [`Error::QuotaExceeded`].
    pub async fn enforce(&self, action: &str, identifier: &str) -> Result<Admission> {
        let Some(policy) = self.policy(action) else {
            return Ok(Admission {
                action: action.to_string(),
                limit: None,
                remaining: None,
                reset_at: None,
            });
        };

        let now = self.clock.now();
        let window_secs = policy.window_secs();
        let outcome = self
            .within(
                self.store
                    .try_record(identifier, action, now, window_secs, policy.limit),
            )
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.record_fail_open(action).await;
                self.metrics.record_decision(action, true).await;
                warn!(action, error = %e, "Rate-limit store unavailable, failing open");
                return Ok(Admission {
                    action: action.to_string(),
                    limit: Some(policy.limit),
                    remaining: Some(policy.limit.saturating_sub(1)),
                    reset_at: Some(now + window_secs as i64),
                });
            }
        };

        let window = outcome.window;
        if !outcome.admitted {
            let retry_after_secs = (window.resets_at(window_secs) - now).max(1) as u64;
            warn!(
                target: "pacekeeper::security",
                event = "rate_limit_exceeded",
                action,
                identifier,
                attempts = window.attempts,
                limit = policy.limit,
                retry_after_secs,
                "Rate limit exceeded"
            );
            self.metrics.record_decision(action, false).await;
            return Err(Error::QuotaExceeded(QuotaDenial {
                action: action.to_string(),
                limit: policy.limit,
                remaining: 0,
                retry_after_secs,
            }));
        }

        debug!(action, attempts = window.attempts, "Admitted attempt");
        self.metrics.record_decision(action, true).await;
        Ok(Admission {
            action: action.to_string(),
            limit: Some(policy.limit),
            remaining: Some(policy.limit.saturating_sub(window.attempts)),
            reset_at: Some(window.resets_at(window_secs)),
        })
    }

    /// Forget the window for this pair, e.g. after a successful login.
    pub async fn reset(&self, action: &str, identifier: &str) -> bool {
        match self
            .within(self.store.reset_window(identifier, action))
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!(action, error = %e, "Failed to reset rate-limit window");
                false
            }
        }
    }

    /// Operator view of one pair; `None` for unknown actions.
    pub async fn status(&self, action: &str, identifier: &str) -> Result<Option<QuotaStatus>> {
        let Some(policy) = self.quotas.get(action).copied() else {
            return Ok(None);
        };
        let now = self.clock.now();
        let window = self.active_window(action, identifier, &policy, now).await?;
        let attempts = window.as_ref().map_or(0, |w| w.attempts);

        Ok(Some(QuotaStatus {
            action: action.to_string(),
            identifier: identifier.to_string(),
            limit: policy.limit,
            window_secs: policy.window_secs(),
            attempts,
            remaining: policy.limit.saturating_sub(attempts),
            reset_at: window.map(|w| w.resets_at(policy.window_secs())),
            allowed: attempts < policy.limit,
        }))
    }

    /// Retention actually applied by `purge_stale`: never shorter than twice
    /// the longest configured window.
    pub fn effective_retention(&self, configured: Duration) -> Duration {
        configured.max(self.quotas.longest_window() * 2)
    }

    /// Delete up to `limit` windows that started before the retention cutoff.
    pub async fn purge_stale(&self, retention: Duration, limit: usize) -> Result<u64> {
        let retention = self.effective_retention(retention);
        let cutoff = self.clock.now() - retention.as_secs() as i64;
        self.within(self.store.purge_windows(cutoff, limit)).await
    }

    pub async fn window_count(&self) -> Result<u64> {
        self.within(self.store.window_count()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{AttemptOutcome, MemoryStore};
    use async_trait::async_trait;

    struct DownWindows;

    #[async_trait]
    impl WindowStore for DownWindows {
        async fn fetch_window(&self, _: &str, _: &str) -> Result<Option<RateWindow>> {
            Err(Error::StoreUnavailable("down".into()))
        }
        async fn record_attempt(&self, _: &str, _: &str, _: i64, _: u64) -> Result<RateWindow> {
            Err(Error::StoreUnavailable("down".into()))
        }
        async fn try_record(
            &self,
            _: &str,
            _: &str,
            _: i64,
            _: u64,
            _: u32,
        ) -> Result<AttemptOutcome> {
            Err(Error::StoreUnavailable("down".into()))
        }
        async fn reset_window(&self, _: &str, _: &str) -> Result<bool> {
            Err(Error::StoreUnavailable("down".into()))
        }
        async fn purge_windows(&self, _: i64, _: usize) -> Result<u64> {
            Err(Error::StoreUnavailable("down".into()))
        }
        async fn window_count(&self) -> Result<u64> {
            Err(Error::StoreUnavailable("down".into()))
        }
    }

    fn limiter(clock: &ManualClock) -> (RateLimiter, MemoryStore) {
        let store = MemoryStore::new();
        let quotas = QuotaTable::new()
            .with("login", QuotaPolicy::new(5, 900))
            .with("email", QuotaPolicy::new(2, 60));
        let limiter = RateLimiter::new(Arc::new(store.clone()), quotas, Arc::new(clock.clone()));
        (limiter, store)
    }

    #[tokio::test]
    async fn test_limit_reached_within_window() {
        let clock = ManualClock::default();
        let (limiter, _) = limiter(&clock);

        for _ in 0..5 {
            assert!(limiter.is_allowed("login", "u1").await);
            limiter.record_attempt("login", "u1").await.unwrap();
        }
        assert!(!limiter.is_allowed("login", "u1").await);
        assert_eq!(limiter.remaining("login", "u1").await, Some(0));
        // other identifiers and actions are independent
        assert!(limiter.is_allowed("login", "u2").await);
        assert!(limiter.is_allowed("email", "u1").await);
    }

    #[tokio::test]
    async fn test_window_elapses_and_resets() {
        let clock = ManualClock::default();
        let start = clock.now();
        let (limiter, _) = limiter(&clock);
        for _ in 0..5 {
            limiter.record_attempt("login", "u1").await;
        }
        assert_eq!(limiter.reset_time("login", "u1").await, Some(start + 900));

        clock.advance(900);
        assert!(limiter.is_allowed("login", "u1").await);
        assert_eq!(limiter.reset_time("login", "u1").await, None);

        let window = limiter.record_attempt("login", "u1").await.unwrap();
        assert_eq!(window.attempts, 1);
        assert_eq!(window.window_start, start + 900);
    }

    #[tokio::test]
    async fn test_unknown_action_fails_open() {
        let clock = ManualClock::default();
        let (limiter, store) = limiter(&clock);

        assert!(limiter.is_allowed("bogus", "u1").await);
        assert!(limiter.record_attempt("bogus", "u1").await.is_none());
        assert_eq!(limiter.remaining("bogus", "u1").await, None);
        let admission = limiter.enforce("bogus", "u1").await.unwrap();
        assert_eq!(admission.limit, None);
        assert_eq!(store.window_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enforce_denies_without_recording() {
        let clock = ManualClock::default();
        let (limiter, store) = limiter(&clock);

        let first = limiter.enforce("email", "u1").await.unwrap();
        assert_eq!(first.remaining, Some(1));
        let second = limiter.enforce("email", "u1").await.unwrap();
        assert_eq!(second.remaining, Some(0));

        clock.advance(15);
        match limiter.enforce("email", "u1").await {
            Err(Error::QuotaExceeded(denial)) => {
                assert_eq!(denial.limit, 2);
                assert_eq!(denial.remaining, 0);
                assert_eq!(denial.retry_after_secs, 45);
            }
            other => panic!("expected denial, got {:?}", other),
        }

        let window = store.fetch_window("u1", "email").await.unwrap().unwrap();
        assert_eq!(window.attempts, 2);

        let metrics = limiter.metrics.get_action_metrics("email").await.unwrap();
        assert_eq!((metrics.allowed, metrics.denied), (2, 1));
    }

    #[tokio::test]
    async fn test_store_down_fails_open() {
        let clock = ManualClock::default();
        let limiter = RateLimiter::new(
            Arc::new(DownWindows),
            QuotaTable::default(),
            Arc::new(clock.clone()),
        );

        assert!(limiter.is_allowed("login", "u1").await);
        assert!(limiter.record_attempt("login", "u1").await.is_none());
        let admission = limiter.enforce("login", "u1").await.unwrap();
        assert_eq!(admission.remaining, Some(4));
        assert!(!limiter.reset("login", "u1").await);
        assert!(limiter.status("login", "u1").await.is_err());
    }

    #[tokio::test]
    async fn test_store_down_counts_one_fail_open_per_decision() {
        let limiter = RateLimiter::new(
            Arc::new(DownWindows),
            QuotaTable::default(),
            Arc::new(ManualClock::default()),
        );

        for _ in 0..3 {
            limiter.enforce("login", "u1").await.unwrap();
        }
        let metrics = limiter.metrics.get_action_metrics("login").await.unwrap();
        assert_eq!(metrics.failed_open, 3);
        assert_eq!(metrics.allowed, 3);
    }

    /// Memory store that takes about a network round-trip per call.
    struct SlowWindows(MemoryStore);

    #[async_trait]
    impl WindowStore for SlowWindows {
        async fn fetch_window(&self, identifier: &str, action: &str) -> Result<Option<RateWindow>> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.0.fetch_window(identifier, action).await
        }
        async fn record_attempt(
            &self,
            identifier: &str,
            action: &str,
            now: i64,
            window_secs: u64,
        ) -> Result<RateWindow> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.0.record_attempt(identifier, action, now, window_secs).await
        }
        async fn try_record(
            &self,
            identifier: &str,
            action: &str,
            now: i64,
            window_secs: u64,
            limit: u32,
        ) -> Result<AttemptOutcome> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.0
                .try_record(identifier, action, now, window_secs, limit)
                .await
        }
        async fn reset_window(&self, identifier: &str, action: &str) -> Result<bool> {
            self.0.reset_window(identifier, action).await
        }
        async fn purge_windows(&self, cutoff: i64, limit: usize) -> Result<u64> {
            self.0.purge_windows(cutoff, limit).await
        }
        async fn window_count(&self) -> Result<u64> {
            self.0.window_count().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_enforce_admits_at_most_limit() {
        let store = MemoryStore::new();
        let limiter = RateLimiter::new(
            Arc::new(SlowWindows(store.clone())),
            QuotaTable::new().with("login", QuotaPolicy::new(5, 900)),
            Arc::new(ManualClock::default()),
        );

        let mut handles = Vec::new();
        for _ in 0..200 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.enforce("login", "u1").await.is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        let window = store.fetch_window("u1", "login").await.unwrap().unwrap();
        assert_eq!(window.attempts, 5);

        let metrics = limiter.metrics.get_action_metrics("login").await.unwrap();
        assert_eq!((metrics.allowed, metrics.denied), (5, 195));
    }

    #[tokio::test]
    async fn test_reset_and_status() {
        let clock = ManualClock::default();
        let (limiter, _) = limiter(&clock);
        limiter.enforce("login", "u1").await.unwrap();
        limiter.enforce("login", "u1").await.unwrap();

        let status = limiter.status("login", "u1").await.unwrap().unwrap();
        assert_eq!(status.attempts, 2);
        assert_eq!(status.remaining, 3);
        assert!(status.allowed);
        assert!(limiter.status("bogus", "u1").await.unwrap().is_none());

        assert!(limiter.reset("login", "u1").await);
        assert_eq!(limiter.remaining("login", "u1").await, Some(5));
        assert_eq!(limiter.retry_after("login", "u1").await, 0);
    }

    #[tokio::test]
    async fn test_purge_stale_uses_safe_retention() {
        let clock = ManualClock::default();
        let (limiter, store) = limiter(&clock);
        limiter.record_attempt("login", "old").await;
        clock.advance(1000);
        limiter.record_attempt("login", "new").await;

        // 10s requested, but the 900s login window forces 1800s.
        assert_eq!(
            limiter.effective_retention(Duration::from_secs(10)),
            Duration::from_secs(1800)
        );
        assert_eq!(limiter.purge_stale(Duration::from_secs(10), 100).await.unwrap(), 0);

        clock.advance(1000);
        assert_eq!(limiter.purge_stale(Duration::from_secs(10), 100).await.unwrap(), 1);
        assert!(store.fetch_window("new", "login").await.unwrap().is_some());
    }
}
