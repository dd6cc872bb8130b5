use crate::config::Config;
use crate::error::Error;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL. Empty means "no Redis" and is allowed.
    pub fn validate_redis_url(url: &str) -> Result<(), Error> {
        if url.is_empty() {
            return Ok(());
        }

        if !url.starts_with("redis://")
            && !url.starts_with("rediss://")
            && !url.starts_with("redis+unix://")
        {
            return Err(Error::Configuration(
                "Redis URL must start with 'redis://', 'rediss://' or 'redis+unix://'".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_cache_dir(config: &Config) -> Result<(), Error> {
        if config.local_cache_dir.as_os_str().is_empty() {
            return Err(Error::Configuration(
                "Local cache directory cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// A sweep that runs less often than the shortest TTL still works, it just
    /// leaves expired rows around longer. Warn-worthy, not fatal.
    pub fn sweep_lags_ttl(config: &Config) -> bool {
        config.sweep_interval_secs > config.default_ttl_secs
    }

    /// Validates the whole configuration, including the quota table it points at
    pub fn validate(config: &Config) -> Result<(), Error> {
        config.check()?;
        Self::validate_redis_url(config.redis_url.trim())?;
        Self::validate_cache_dir(config)?;
        config.quota_table()?.validate()?;

        if Self::sweep_lags_ttl(config) {
            tracing::warn!(
                sweep_interval_secs = config.sweep_interval_secs,
                default_ttl_secs = config.default_ttl_secs,
                "Sweep interval exceeds default TTL"
            );
        }

        Ok(())
    }
}
