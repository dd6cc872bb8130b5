//! Get-or-populate accessors bound to a fixed key and TTL.
//!
//! Handlers share one definition per aggregate so every page reads and
//! invalidates the same entry:
//!
//! ```ignore
//! let categories = accessors::active_categories::<Vec<Category>>()
//!     .get(&cache, || repo.active_categories())
//!     .await?;
//! ```

use crate::cache::CacheManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

pub struct CachedQuery<T> {
    key: &'static str,
    ttl: Duration,
    _payload: PhantomData<fn() -> T>,
}

impl<T> CachedQuery<T> {
    pub const fn new(key: &'static str, ttl_secs: u64) -> Self {
        Self {
            key,
            ttl: Duration::from_secs(ttl_secs),
            _payload: PhantomData,
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop the cached copy, e.g. after an admin edits the underlying rows.
    pub async fn invalidate(&self, cache: &CacheManager) -> bool {
        cache.delete(self.key).await
    }
}

impl<T> CachedQuery<T>
where
    T: Serialize + DeserializeOwned,
{
    pub async fn get<F, Fut, E>(&self, cache: &CacheManager, populate: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        cache.remember(self.key, self.ttl, populate).await
    }

    /// Cached copy only; never populates.
    pub async fn peek(&self, cache: &CacheManager) -> Option<T> {
        cache.get(self.key).await
    }
}

/// Race categories open for registration.
pub const fn active_categories<T>() -> CachedQuery<T> {
    CachedQuery::new("categories_active", 300)
}

/// Entrant counts per category shown on the public pages.
pub const fn registration_totals<T>() -> CachedQuery<T> {
    CachedQuery::new("registration_totals", 60)
}

pub const fn event_settings<T>() -> CachedQuery<T> {
    CachedQuery::new("event_settings", 3600)
}
