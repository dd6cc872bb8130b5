use crate::cache::CacheManager;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::config_validator::ConfigValidator;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::quota::QuotaTable;
use crate::rate_limiter::RateLimiter;
use crate::storage::{CacheStore, FileStore, MemoryStore, RedisStore, WindowStore};
use crate::sweeper::{SweepSettings, Sweeper};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Explicitly constructed runtime context handed to request handlers.
///
/// Owns the sweeper task; call [`Runtime::shutdown`] to stop it.
pub struct Runtime {
    cache: CacheManager,
    limiter: RateLimiter,
    metrics: MetricsCollector,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Option<JoinHandle<()>>,
}

pub struct RuntimeBuilder {
    cache_store: Arc<dyn CacheStore>,
    window_store: Arc<dyn WindowStore>,
    local: Option<Arc<dyn CacheStore>>,
    quotas: QuotaTable,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    tier_timeout: Duration,
    sweep: Option<SweepSettings>,
}

impl RuntimeBuilder {
    /// `cache_store` and `window_store` are usually the same backend.
    pub fn new(cache_store: Arc<dyn CacheStore>, window_store: Arc<dyn WindowStore>) -> Self {
        Self {
            cache_store,
            window_store,
            local: None,
            quotas: QuotaTable::default(),
            clock: Arc::new(SystemClock),
            default_ttl: crate::cache::DEFAULT_TTL,
            tier_timeout: crate::cache::DEFAULT_TIER_TIMEOUT,
            sweep: Some(SweepSettings::default()),
        }
    }

    pub fn local(mut self, local: Arc<dyn CacheStore>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn quotas(mut self, quotas: QuotaTable) -> Self {
        self.quotas = quotas;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn tier_timeout(mut self, timeout: Duration) -> Self {
        self.tier_timeout = timeout;
        self
    }

    /// `None` disables the background sweeper.
    pub fn sweep(mut self, settings: Option<SweepSettings>) -> Self {
        self.sweep = settings;
        self
    }

    /// Must be called inside a tokio runtime when sweeping is enabled.
    pub fn start(self) -> Runtime {
        let metrics = MetricsCollector::new();

        let mut cache = CacheManager::new(self.cache_store, self.clock.clone())
            .with_metrics(metrics.clone())
            .with_default_ttl(self.default_ttl)
            .with_tier_timeout(self.tier_timeout);
        if let Some(local) = self.local {
            cache = cache.with_local(local);
        }

        let limiter = RateLimiter::new(self.window_store, self.quotas, self.clock)
            .with_metrics(metrics.clone())
            .with_tier_timeout(self.tier_timeout);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = self.sweep.map(|settings| {
            Sweeper::new(cache.clone(), limiter.clone(), metrics.clone(), settings)
                .spawn(shutdown_rx)
        });

        Runtime {
            cache,
            limiter,
            metrics,
            shutdown_tx,
            sweeper,
        }
    }
}

impl Runtime {
    /// Builder over a single backend serving both the cache and the limiter.
    pub fn builder<S>(store: Arc<S>) -> RuntimeBuilder
    where
        S: CacheStore + WindowStore + 'static,
    {
        RuntimeBuilder::new(store.clone(), store)
    }

    /// Build the runtime described by `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        crate::health::mark_started();
        ConfigValidator::validate(config)?;

        let mut builder = if config.uses_redis() {
            info!(redis_url = %config.redis_url, "Using Redis persistent tier");
            let store = RedisStore::new(config.redis_url.trim(), &config.key_prefix)?
                .with_window_retention(config.sweep_settings().retention);
            Runtime::builder(Arc::new(store))
        } else {
            warn!("REDIS_URL not set, persistent tier is process-local memory");
            Runtime::builder(Arc::new(MemoryStore::new()))
        };

        let local = match FileStore::open(&config.local_cache_dir).await {
            Ok(store) => Some(Arc::new(store) as Arc<dyn CacheStore>),
            Err(e) => {
                warn!(
                    dir = %config.local_cache_dir.display(),
                    error = %e,
                    "Local cache tier unavailable, running without fallback"
                );
                None
            }
        };

        builder = builder
            .quotas(config.quota_table()?)
            .default_ttl(config.default_ttl())
            .tier_timeout(config.tier_timeout())
            .sweep(Some(config.sweep_settings()));
        if let Some(local) = local {
            builder = builder.local(local);
        }

        Ok(builder.start())
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Stop the sweeper and wait for it to finish its current pass.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.sweeper.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sweeper task ended abnormally");
            }
        }
        info!("Runtime shut down");
    }
}
