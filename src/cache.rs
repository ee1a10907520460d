use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FundError;
use crate::model::{CacheEntry, CacheKey};
use crate::util::{ensure_directory, safe_file_stem, write_json_atomic};

pub const INDEX_FILE_NAME: &str = "index.json";
pub const BLOB_DIR_NAME: &str = "pdfs";

type CacheIndex = BTreeMap<String, CacheEntry>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub downloads: u64,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            total => self.hits as f64 / total as f64,
        }
    }
}

/// Document cache: one blob per `(registry_id, series_code)` under `pdfs/`
/// plus a JSON index. Validity is re-checked against the blob and the clock
/// on every read; stale records are removed on sight.
pub struct CacheManager {
    root: PathBuf,
    blob_dir: PathBuf,
    index_path: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    downloads: AtomicU64,
}

impl CacheManager {
    pub fn open(root: &Path, ttl_days: i64, clock: Arc<dyn Clock>) -> Self {
        let blob_dir = root.join(BLOB_DIR_NAME);
        if let Err(error) = ensure_directory(&blob_dir) {
            warn!(path = %blob_dir.display(), error = %error, "cache directory unavailable");
        }

        info!(
            root = %root.display(),
            ttl_days,
            "document cache opened"
        );

        Self {
            root: root.to_path_buf(),
            index_path: root.join(INDEX_FILE_NAME),
            blob_dir,
            ttl: Duration::days(ttl_days),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let index_key = key.index_key();
        let mut index = match self.read_index() {
            Ok(index) => index,
            Err(error) => {
                warn!(key = %index_key, error = %format!("{error:#}"), "cache index unreadable, treating as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let Some(entry) = index.get(&index_key).cloned() else {
            debug!(key = %index_key, "cache miss");
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let now = self.clock.now();
        let blob_present = Path::new(&entry.blob_path).is_file();
        if blob_present && !entry.is_expired_at(now) {
            info!(key = %index_key, expires_at = %entry.expires_at, "cache hit");
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry);
        }

        let reason = if blob_present { "expired" } else { "blob missing" };
        info!(key = %index_key, reason, "dropping stale cache entry");
        remove_blob(&entry);
        index.remove(&index_key);
        if let Err(error) = self.write_index(&index) {
            warn!(key = %index_key, error = %format!("{error:#}"), "failed to persist cache index");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<CacheEntry, FundError> {
        let index_key = key.index_key();
        self.store_inner(key, bytes).map_err(|error| {
            warn!(key = %index_key, error = %format!("{error:#}"), "cache store failed");
            FundError::CacheIo(format!("{error:#}"))
        })
    }

    fn store_inner(&self, key: &CacheKey, bytes: &[u8]) -> Result<CacheEntry> {
        ensure_directory(&self.blob_dir)?;
        let index_key = key.index_key();
        let blob_path = self
            .blob_dir
            .join(format!("{}.pdf", safe_file_stem(&index_key)));

        let staging = self
            .blob_dir
            .join(format!(".{}.{}.tmp", safe_file_stem(&index_key), std::process::id()));
        fs::write(&staging, bytes)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        fs::rename(&staging, &blob_path)
            .with_context(|| format!("failed to move blob into {}", blob_path.display()))?;

        let downloaded_at = self.clock.now();
        let entry = CacheEntry {
            registry_id: key.registry_id.clone(),
            series_code: key.series_code.clone(),
            blob_path: blob_path.display().to_string(),
            downloaded_at,
            expires_at: downloaded_at + self.ttl,
            size_bytes: bytes.len() as u64,
        };

        // Re-read so entries written since our last read are merged, not lost.
        let (mut index, rebuilt) = match self.read_index() {
            Ok(index) => (index, false),
            Err(error) => {
                warn!(error = %format!("{error:#}"), "cache index unreadable, rebuilding");
                (CacheIndex::new(), true)
            }
        };
        index.insert(index_key.clone(), entry.clone());
        self.write_index(&index)?;
        if rebuilt {
            self.purge_unindexed_blobs(&index);
        }

        info!(
            key = %index_key,
            size_bytes = entry.size_bytes,
            expires_at = %entry.expires_at,
            "cached document"
        );
        Ok(entry)
    }

    pub fn read_blob(&self, entry: &CacheEntry) -> Result<Vec<u8>, FundError> {
        fs::read(&entry.blob_path).map_err(|error| {
            warn!(path = %entry.blob_path, error = %error, "failed to read cached blob");
            FundError::CacheIo(format!("failed to read {}: {error}", entry.blob_path))
        })
    }

    pub fn sweep_expired(&self) -> usize {
        let mut index = match self.read_index() {
            Ok(index) => index,
            Err(error) => {
                warn!(error = %format!("{error:#}"), "cache sweep skipped, index unreadable");
                return 0;
            }
        };

        let now = self.clock.now();
        let expired = index
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        for key in &expired {
            if let Some(entry) = index.remove(key) {
                remove_blob(&entry);
            }
        }

        if !expired.is_empty()
            && let Err(error) = self.write_index(&index)
        {
            warn!(error = %format!("{error:#}"), "failed to persist swept cache index");
        }

        info!(removed = expired.len(), remaining = index.len(), "cache sweep finished");
        expired.len()
    }

    pub fn record_download(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
        }
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(self.read_index()?.into_values().collect())
    }

    pub fn log_statistics(&self) {
        let stats = self.stats();
        let entries = self.entries().unwrap_or_default();
        let total_bytes: u64 = entries.iter().map(|entry| entry.size_bytes).sum();

        info!(
            hits = stats.hits,
            misses = stats.misses,
            downloads = stats.downloads,
            lookups = stats.lookups(),
            hit_rate = %format!("{:.1}%", stats.hit_rate() * 100.0),
            cached_entries = entries.len(),
            cached_mb = %format!("{:.2}", total_bytes as f64 / (1024.0 * 1024.0)),
            "cache statistics"
        );
    }

    /// Deletes blobs the index no longer references.
    fn purge_unindexed_blobs(&self, index: &CacheIndex) -> usize {
        let entries = match fs::read_dir(&self.blob_dir) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(path = %self.blob_dir.display(), error = %error, "cannot list cache blobs");
                return 0;
            }
        };
        let referenced = index
            .values()
            .map(|entry| PathBuf::from(&entry.blob_path))
            .collect::<Vec<_>>();

        let mut removed = 0;
        for path in entries.filter_map(|entry| entry.ok()).map(|entry| entry.path()) {
            let is_blob = path.extension().is_some_and(|ext| ext == "pdf");
            if !is_blob || referenced.contains(&path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(error) => warn!(path = %path.display(), error = %error, "failed to delete orphaned blob"),
            }
        }
        if removed > 0 {
            info!(removed, "orphaned cache blobs deleted");
        }
        removed
    }

    fn read_index(&self) -> Result<CacheIndex> {
        if !self.index_path.exists() {
            return Ok(CacheIndex::new());
        }
        let raw = fs::read(&self.index_path)
            .with_context(|| format!("failed to read {}", self.index_path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", self.index_path.display()))
    }

    fn write_index(&self, index: &CacheIndex) -> Result<()> {
        write_json_atomic(&self.index_path, index)
    }
}

fn remove_blob(entry: &CacheEntry) {
    match fs::remove_file(&entry.blob_path) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %entry.blob_path, error = %error, "failed to delete cached blob"),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ManualClock, fixed_start};
    use super::*;

    fn cache_with_clock(root: &Path) -> (CacheManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(fixed_start()));
        let cache = CacheManager::open(root, 30, clock.clone());
        (cache, clock)
    }

    fn index_keys(root: &Path) -> Vec<String> {
        let raw = fs::read(root.join(INDEX_FILE_NAME)).expect("index exists");
        let index: CacheIndex = serde_json::from_slice(&raw).expect("index parses");
        index.into_keys().collect()
    }

    #[test]
    fn store_then_lookup_returns_identical_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (cache, _) = cache_with_clock(dir.path());
        let key = CacheKey::new("8638", "A");
        let bytes = b"%PDF-1.7 body".to_vec();

        let stored = cache.store(&key, &bytes).expect("store");
        assert!(stored.expires_at > stored.downloaded_at);
        assert_eq!(stored.size_bytes, bytes.len() as u64);

        let entry = cache.lookup(&key).expect("hit");
        assert_eq!(cache.read_blob(&entry).expect("blob"), bytes);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 0,
                downloads: 0
            }
        );
        assert_eq!(index_keys(dir.path()), vec!["8638_A".to_string()]);
    }

    #[test]
    fn expired_entry_misses_and_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (cache, clock) = cache_with_clock(dir.path());
        let key = CacheKey::new("9100", "UNICA");
        let entry = cache.store(&key, b"%PDF-old").expect("store");

        clock.advance(Duration::days(30));
        assert!(cache.lookup(&key).is_some(), "still valid exactly at expiry");

        clock.advance(Duration::seconds(1));
        assert!(cache.lookup(&key).is_none());
        assert!(index_keys(dir.path()).is_empty());
        assert!(!Path::new(&entry.blob_path).exists());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn externally_deleted_blob_self_heals() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (cache, _) = cache_with_clock(dir.path());
        let key = CacheKey::new("8052", "B");
        let entry = cache.store(&key, b"%PDF-x").expect("store");

        fs::remove_file(&entry.blob_path).expect("delete blob");
        assert!(cache.lookup(&key).is_none());
        assert!(index_keys(dir.path()).is_empty());
    }

    #[test]
    fn sweep_is_idempotent_and_tolerates_missing_blobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (cache, clock) = cache_with_clock(dir.path());
        let old = cache.store(&CacheKey::new("1", "A"), b"%PDF-1").expect("store");
        cache.store(&CacheKey::new("2", "A"), b"%PDF-2").expect("store");
        fs::remove_file(&old.blob_path).expect("delete blob");

        clock.advance(Duration::days(20));
        cache.store(&CacheKey::new("3", "A"), b"%PDF-3").expect("store");
        clock.advance(Duration::days(15));

        assert_eq!(cache.sweep_expired(), 2);
        assert_eq!(cache.sweep_expired(), 0);
        assert_eq!(index_keys(dir.path()), vec!["3_A".to_string()]);
    }

    #[test]
    fn corrupt_index_degrades_to_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (cache, _) = cache_with_clock(dir.path());
        fs::write(dir.path().join(INDEX_FILE_NAME), b"{not json").expect("write");

        assert!(cache.lookup(&CacheKey::new("1", "A")).is_none());
        assert_eq!(cache.sweep_expired(), 0);

        let entry = cache
            .store(&CacheKey::new("1", "A"), b"%PDF-new")
            .expect("store rebuilds index");
        assert_eq!(entry.registry_id, "1");
        assert_eq!(index_keys(dir.path()), vec!["1_A".to_string()]);
    }

    #[test]
    fn rebuilt_index_drops_unreferenced_blobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (cache, clock) = cache_with_clock(dir.path());
        let first = cache.store(&CacheKey::new("1", "A"), b"%PDF-1").expect("store");
        let second = cache.store(&CacheKey::new("2", "A"), b"%PDF-2").expect("store");
        fs::write(dir.path().join(INDEX_FILE_NAME), b"{not json").expect("write");

        let third = cache.store(&CacheKey::new("3", "A"), b"%PDF-3").expect("store");

        assert!(!Path::new(&first.blob_path).exists());
        assert!(!Path::new(&second.blob_path).exists());
        assert!(Path::new(&third.blob_path).exists());
        assert_eq!(index_keys(dir.path()), vec!["3_A".to_string()]);

        clock.advance(Duration::days(31));
        assert_eq!(cache.sweep_expired(), 1);
        let blobs_left = fs::read_dir(dir.path().join(BLOB_DIR_NAME))
            .expect("blob dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "pdf"))
            .count();
        assert_eq!(blobs_left, 0);
    }

    #[test]
    fn hit_rate_counts_downloads_separately() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            downloads: 1,
        };
        assert_eq!(stats.lookups(), 4);
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
