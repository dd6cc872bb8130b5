use crate::error::{Error, Result};
use crate::quota::QuotaTable;
use crate::sweeper::SweepSettings;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

#[derive(Debug, Clone, Parser, Validate)]
#[command(name = "pacekeeper", version, about = "Cache and rate-limit runtime")]
pub struct Config {
    /// Operator HTTP bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis URL for the persistent tier; empty keeps state in process memory
    #[arg(long, env = "REDIS_URL", default_value = "")]
    pub redis_url: String,

    /// Prefix for every Redis key
    #[arg(long, env = "KEY_PREFIX", default_value = "pacekeeper:")]
    #[validate(length(min = 1, max = 64))]
    pub key_prefix: String,

    /// Directory of the per-host fallback tier
    #[arg(long, env = "LOCAL_CACHE_DIR", default_value = "var/cache")]
    pub local_cache_dir: PathBuf,

    #[arg(long, env = "DEFAULT_TTL_SECS", default_value_t = 3600)]
    #[validate(range(min = 1))]
    pub default_ttl_secs: u64,

    /// Per-call timeout for any tier before it counts as unavailable
    #[arg(long, env = "TIER_TIMEOUT_MS", default_value_t = 250)]
    #[validate(range(min = 1, max = 10_000))]
    pub tier_timeout_ms: u64,

    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 300)]
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,

    /// Upper bound on rows or files removed per store per sweep
    #[arg(long, env = "SWEEP_BATCH_SIZE", default_value_t = 500)]
    #[validate(range(min = 1, max = 100_000))]
    pub sweep_batch_size: usize,

    /// How long rate-limit windows are kept after they start
    #[arg(long, env = "RATE_LIMIT_RETENTION_SECS", default_value_t = 86_400)]
    pub rate_limit_retention_secs: u64,

    /// JSON quota table; the built-in table is used when unset
    #[arg(long, env = "QUOTA_FILE")]
    pub quota_file: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: String::new(),
            key_prefix: "pacekeeper:".to_string(),
            local_cache_dir: PathBuf::from("var/cache"),
            default_ttl_secs: 3600,
            tier_timeout_ms: 250,
            sweep_interval_secs: 300,
            sweep_batch_size: 500,
            rate_limit_retention_secs: 86_400,
            quota_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the command line and environment
    pub fn from_env() -> Self {
        Config::parse()
    }

    pub fn uses_redis(&self) -> bool {
        !self.redis_url.trim().is_empty()
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_timeout_ms)
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            interval: Duration::from_secs(self.sweep_interval_secs),
            batch_size: self.sweep_batch_size,
            retention: Duration::from_secs(self.rate_limit_retention_secs),
        }
    }

    pub fn quota_table(&self) -> Result<QuotaTable> {
        match &self.quota_file {
            Some(path) => QuotaTable::from_json_file(path),
            None => Ok(QuotaTable::default()),
        }
    }

    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::Configuration(e.to_string()))
    }
}
