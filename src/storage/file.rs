//! Per-host fallback tier: one JSON file per cache key.
//!
//! File names are the SHA-256 of the logical key, so arbitrary keys cannot
//! produce invalid names or escape the directory. Writes land in a temp file
//! first and are renamed over the target.
//!
//! Each entry file's modification time is set to its `expires_at`, so sweeps
//! and stats can skip live files with a `stat` instead of reading them.

use super::{CacheEntry, CacheStore, Tier, TierStats};
use crate::error::{Error, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::{debug, warn};

const ENTRY_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Temp files younger than this may belong to a write in flight.
const STALE_TEMP_AGE_SECS: i64 = 60;

/// Directory listing split into entry files and leftover temp files.
#[derive(Debug, Default)]
struct Listing {
    entries: Vec<PathBuf>,
    temps: Vec<PathBuf>,
}

fn modified_secs(metadata: &Metadata) -> Option<i64> {
    let modified = metadata.modified().ok()?;
    match modified.duration_since(UNIX_EPOCH) {
        Ok(after) => Some(after.as_secs() as i64),
        Err(before) => Some(-(before.duration().as_secs() as i64)),
    }
}

fn epoch_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(dir);
        fs::create_dir_all(&store.dir).await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name_for(key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        format!("{}.{}", hex::encode(digest), ENTRY_EXTENSION)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(Self::file_name_for(key))
    }

    async fn read_entry(path: &Path) -> Result<Option<CacheEntry>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn metadata(path: &Path) -> Result<Option<Metadata>> {
        match fs::metadata(path).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Listing> {
        let mut listing = Listing::default();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(listing),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(ENTRY_EXTENSION) => listing.entries.push(path),
                Some(TEMP_EXTENSION) => listing.temps.push(path),
                _ => {}
            }
        }
        Ok(listing)
    }

    async fn write_temp(tmp: &Path, bytes: Vec<u8>, expires_at: i64) -> Result<()> {
        fs::write(tmp, bytes).await?;
        let file = fs::OpenOptions::new().write(true).open(tmp).await?;
        file.into_std().await.set_modified(epoch_time(expires_at))?;
        Ok(())
    }

    /// Remove temp files left behind by interrupted writes.
    async fn reclaim_temps(&self, temps: Vec<PathBuf>, older_than: Option<i64>) -> Result<u64> {
        let mut removed = 0;
        for path in temps {
            if let Some(cutoff) = older_than {
                let Some(metadata) = Self::metadata(&path).await? else {
                    continue;
                };
                if modified_secs(&metadata).is_some_and(|secs| secs > cutoff) {
                    continue;
                }
            }
            if Self::remove(&path).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "Reclaimed stray temp files");
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheStore for FileStore {
    fn tier(&self) -> Tier {
        Tier::Local
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entry = Self::read_entry(&self.path_for(key)).await?;
        match entry {
            // Guard against a hash collision or a file copied from elsewhere.
            Some(entry) if entry.key != key => Ok(None),
            other => Ok(other),
        }
    }

    async fn set(&self, entry: &CacheEntry) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let target = self.path_for(&entry.key);
        let tmp = self
            .dir
            .join(format!(".{}.{}", uuid::Uuid::new_v4(), TEMP_EXTENSION));

        let bytes = serde_json::to_vec(entry)?;
        if let Err(e) = Self::write_temp(&tmp, bytes, entry.expires_at).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Self::remove(&self.path_for(key)).await
    }

    /// Removes every entry and every temp file; only entries are counted.
    async fn clear(&self) -> Result<u64> {
        let listing = self.list().await?;
        let mut removed = 0;
        for path in &listing.entries {
            if Self::remove(path).await? {
                removed += 1;
            }
        }
        self.reclaim_temps(listing.temps, None).await?;
        debug!(removed, dir = %self.dir.display(), "Cleared local cache tier");
        Ok(removed)
    }

    async fn purge_expired(&self, now: i64, limit: usize) -> Result<u64> {
        let listing = self.list().await?;
        self.reclaim_temps(listing.temps, Some(now - STALE_TEMP_AGE_SECS))
            .await?;

        let mut removed = 0u64;
        for path in listing.entries {
            if removed as usize >= limit {
                break;
            }

            let Some(metadata) = Self::metadata(&path).await? else {
                continue;
            };
            if modified_secs(&metadata).is_some_and(|expires_at| expires_at > now) {
                continue;
            }

            let stale = match Self::read_entry(&path).await {
                Ok(Some(entry)) => entry.is_expired(now),
                Ok(None) => false,
                Err(Error::Serialization(e)) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Removing undecodable local cache file"
                    );
                    true
                }
                Err(e) => return Err(e),
            };

            if stale && Self::remove(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn stats(&self, now: i64) -> Result<TierStats> {
        let mut stats = TierStats::default();
        for path in self.list().await?.entries {
            let Some(metadata) = Self::metadata(&path).await? else {
                continue;
            };
            stats.entries += 1;
            stats.size_bytes += metadata.len();
            if modified_secs(&metadata).is_some_and(|expires_at| expires_at <= now) {
                stats.expired += 1;
            }
        }
        Ok(stats)
    }

    async fn ping(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let marker = self.dir.join(format!(".ping-{}", uuid::Uuid::new_v4()));
        fs::write(&marker, b"ok").await?;
        fs::remove_file(&marker).await?;
        Ok(())
    }
}
