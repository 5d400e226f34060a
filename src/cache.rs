//! The certificate parse cache.
//!
//! A size-bounded, TTL'd key/value store used by the scanner to skip
//! re-parsing unchanged files. Entries are evicted least-recently-used when
//! the configured byte budget would be exceeded. When the configured cache
//! type is `file` or `both`, the store is snapshotted to
//! `<cache_dir>/cache.json` with an atomic temp-and-rename write.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use foldhash::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::util;

/// How often the maintenance loop sweeps expired entries and saves to disk.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

/// The file name of the on-disk snapshot.
const CACHE_FILE_NAME: &str = "cache.json";

//------------ CacheEntry ----------------------------------------------------

/// A cache entry with metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cached value.
    pub value: Value,

    /// Creation time, fractional seconds since the Unix epoch.
    pub timestamp: f64,

    /// Time to live in seconds.
    pub ttl: u64,

    /// The serialized size of `value` in bytes, as admitted.
    pub size: u64,

    /// How often this entry has been read.
    #[serde(default)]
    pub access_count: u64,

    /// Last read time, fractional seconds since the Unix epoch.
    #[serde(default)]
    pub last_access: f64,
}

impl CacheEntry {
    fn is_expired_at(&self, now: f64) -> bool {
        now - self.timestamp > self.ttl as f64
    }
}

//------------ CacheStats ----------------------------------------------------

/// Point-in-time cache statistics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries_total: usize,
    pub current_size_bytes: u64,
    pub max_size_bytes: u64,
    pub hit_rate: f64,
    pub total_accesses: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// The cache fragment of the health endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct CacheHealth {
    pub cache_entries_total: usize,
    pub cache_file_path: Option<Utf8PathBuf>,
    pub cache_file_writable: bool,
    pub cache_hit_rate: f64,
    pub cache_total_accesses: u64,
}

//------------ Cache ---------------------------------------------------------

/// The in-memory state behind the cache lock.
#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    current_size: u64,
    access_count: u64,
    hit_count: u64,
}

/// The shared parse cache.
///
/// All operations serialize through a single lock; the cache is not a hot
/// path compared to scan throughput.
#[derive(Debug)]
pub struct Cache {
    state: Mutex<CacheState>,
    ttl: u64,
    max_size: u64,
    cache_dir: Utf8PathBuf,
    cache_file: Option<Utf8PathBuf>,
}

impl Cache {
    pub fn new(config: &Config) -> Self {
        let cache_file = config
            .cache_type
            .persists()
            .then(|| config.cache_dir.join(CACHE_FILE_NAME));
        Self {
            state: Mutex::new(CacheState::default()),
            ttl: config.cache_ttl.as_secs(),
            max_size: config.cache_max_size,
            cache_dir: config.cache_dir.clone(),
            cache_file,
        }
    }

    /// Load the persisted snapshot, if any.
    ///
    /// Expired entries are dropped on load; a malformed snapshot is deleted
    /// and the cache starts empty.
    pub async fn initialize(&self) -> io::Result<()> {
        if self.cache_file.is_some() {
            std::fs::create_dir_all(&self.cache_dir)?;
        }
        self.load_persistent().await;
        info!(
            "Cache initialized - TTL: {}s, Max size: {} bytes",
            self.ttl, self.max_size
        );
        Ok(())
    }

    /// Get a value, counting the access. Expired entries are deleted and
    /// report a miss.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut state = self.state.lock().await;
        state.access_count += 1;

        let now = util::now_secs();
        let expired = match state.entries.get(key) {
            None => {
                debug!("Cache miss: {key}");
                return None;
            }
            Some(entry) => entry.is_expired_at(now),
        };

        if expired {
            if let Some(entry) = state.entries.remove(key) {
                state.current_size = state.current_size.saturating_sub(entry.size);
            }
            debug!("Cache miss: {key}");
            return None;
        }

        state.hit_count += 1;
        let entry = state.entries.get_mut(key).expect("entry checked above");
        entry.access_count += 1;
        entry.last_access = now;
        debug!("Cache hit: {key}");
        Some(entry.value.clone())
    }

    /// Store a value under the default TTL.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) {
        self.set_with_ttl(key, value, None).await
    }

    /// Store a value.
    ///
    /// A value that fails serialization, or whose serialized size alone
    /// exceeds the cache budget, is rejected with a warning.
    pub async fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Option<u64>) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to serialize value for key {key}: {err}");
                return;
            }
        };
        let size = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes.len() as u64,
            Err(err) => {
                warn!("Failed to serialize value for key {key}: {err}");
                return;
            }
        };

        if size > self.max_size {
            warn!("Value for key {key} ({size} bytes) exceeds the cache budget; not cached");
            return;
        }

        let mut state = self.state.lock().await;

        // Replacing an entry frees its old budget before eviction runs.
        if let Some(old) = state.entries.remove(key) {
            state.current_size = state.current_size.saturating_sub(old.size);
        }

        Self::ensure_space(&mut state, size, self.max_size);

        let entry = CacheEntry {
            value,
            timestamp: util::now_secs(),
            ttl: ttl.unwrap_or(self.ttl),
            size,
            access_count: 0,
            last_access: 0.0,
        };
        state.entries.insert(key.to_string(), entry);
        state.current_size += size;
        debug!("Cache set: {key}");
    }

    /// Delete a key. Returns whether it was present.
    pub async fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.entries.remove(key) {
            Some(entry) => {
                state.current_size = state.current_size.saturating_sub(entry.size);
                debug!("Cache invalidate: {key}");
                true
            }
            None => false,
        }
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.current_size = 0;
        info!("Cache cleared");
    }

    /// Sweep expired entries, returning how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = util::now_secs();

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = state.entries.remove(key) {
                state.current_size = state.current_size.saturating_sub(entry.size);
            }
        }

        if !expired.is_empty() {
            info!("Cleaned up {} expired cache entries", expired.len());
        }
        expired.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let hit_rate = if state.access_count > 0 {
            state.hit_count as f64 / state.access_count as f64
        } else {
            0.0
        };
        CacheStats {
            entries_total: state.entries.len(),
            current_size_bytes: state.current_size,
            max_size_bytes: self.max_size,
            hit_rate,
            total_accesses: state.access_count,
            cache_hits: state.hit_count,
            cache_misses: state.access_count - state.hit_count,
        }
    }

    pub async fn health_status(&self) -> CacheHealth {
        let stats = self.stats().await;
        let writable = std::fs::metadata(&self.cache_dir)
            .map(|meta| !meta.permissions().readonly())
            .unwrap_or(false);
        CacheHealth {
            cache_entries_total: stats.entries_total,
            cache_file_path: self.cache_file.clone(),
            cache_file_writable: writable,
            cache_hit_rate: (stats.hit_rate * 1000.0).round() / 1000.0,
            cache_total_accesses: stats.total_accesses,
        }
    }

    /// Write the snapshot to disk. Failures are logged, never propagated.
    pub async fn save_to_disk(&self) {
        let Some(cache_file) = &self.cache_file else {
            return;
        };

        let persisted = {
            let state = self.state.lock().await;
            let now = util::now_secs();
            PersistedCache {
                entries: state
                    .entries
                    .iter()
                    .filter(|(_, entry)| !entry.is_expired_at(now))
                    .map(|(key, entry)| (key.clone(), entry.clone()))
                    .collect(),
                stats: PersistedStats {
                    access_count: state.access_count,
                    hit_count: state.hit_count,
                },
            }
        };

        let contents = match serde_json::to_vec_pretty(&persisted) {
            Ok(contents) => contents,
            Err(err) => {
                error!("Failed to serialize cache: {err}");
                return;
            }
        };
        match util::write_file(cache_file, &contents) {
            Ok(()) => debug!("Cache saved to disk"),
            Err(err) => error!("Failed to save cache to disk: {err}"),
        }
    }

    /// Save and shut down.
    pub async fn close(&self) {
        self.save_to_disk().await;
        info!("Cache closed");
    }

    /// Periodic maintenance: sweep expired entries, then snapshot.
    pub async fn maintenance_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(MAINTENANCE_INTERVAL).await;
            let expired = self.cleanup_expired().await;
            if expired > 0 {
                debug!("Cache maintenance removed {expired} expired entries");
            }
            self.save_to_disk().await;
            let stats = self.stats().await;
            debug!(
                "Cache maintenance: {} entries, {} bytes, {:.2}% hit rate",
                stats.entries_total,
                stats.current_size_bytes,
                stats.hit_rate * 100.0
            );
        }
    }

    /// Derive a cache key from identity-bearing arguments.
    ///
    /// The key is the first 16 hex characters of the SHA-256 of a
    /// deterministic rendering of the argument list. 64 bits of key space
    /// make collisions acceptable for this use.
    pub fn make_key(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{parts:?}").as_bytes());
        let digest = hasher.finalize();
        let mut key = String::with_capacity(16);
        for byte in &digest[..8] {
            key.push_str(&format!("{byte:02x}"));
        }
        key
    }

    async fn load_persistent(&self) {
        let Some(cache_file) = &self.cache_file else {
            return;
        };
        if !cache_file.exists() {
            return;
        }

        let persisted: PersistedCache = match std::fs::read(cache_file)
            .map_err(|err| err.to_string())
            .and_then(|data| serde_json::from_slice(&data).map_err(|err| err.to_string()))
        {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!("Failed to load persistent cache: {err}");
                match std::fs::remove_file(cache_file) {
                    Ok(()) => info!("Removed corrupted cache file"),
                    Err(err) => warn!("Could not remove corrupted cache file: {err}"),
                }
                return;
            }
        };

        let mut state = self.state.lock().await;
        let now = util::now_secs();
        for (key, entry) in persisted.entries {
            if !entry.is_expired_at(now) {
                state.current_size += entry.size;
                state.entries.insert(key, entry);
            }
        }
        state.access_count = persisted.stats.access_count;
        state.hit_count = persisted.stats.hit_count;
        info!("Loaded {} entries from persistent cache", state.entries.len());
    }

    /// Evict least-recently-used entries until `needed` more bytes fit.
    ///
    /// Ties on last access fall back to creation order.
    fn ensure_space(state: &mut CacheState, needed: u64, max_size: u64) {
        if state.current_size + needed <= max_size {
            return;
        }

        let mut order: Vec<(String, f64, f64, u64)> = state
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_access, entry.timestamp, entry.size))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.2.total_cmp(&b.2)));

        let mut freed = 0u64;
        let mut evicted = 0usize;
        for (key, _, _, size) in order {
            if state.current_size + needed - freed <= max_size {
                break;
            }
            state.entries.remove(&key);
            freed += size;
            evicted += 1;
        }
        state.current_size = state.current_size.saturating_sub(freed);

        if evicted > 0 {
            info!("Evicted {evicted} LRU cache entries to free {freed} bytes");
        }
    }
}

//------------ Persistence format --------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache {
    entries: std::collections::HashMap<String, CacheEntry>,
    stats: PersistedStats,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStats {
    #[serde(default)]
    access_count: u64,
    #[serde(default)]
    hit_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheType;
    use serde_json::json;

    fn test_cache(max_size: u64, ttl_secs: u64) -> Cache {
        let config = Config {
            cache_type: CacheType::Memory,
            cache_max_size: max_size,
            cache_ttl: crate::config::TimeSpan::from_secs(ttl_secs),
            certificate_directories: Vec::new(),
            ..Default::default()
        };
        Cache::new(&config)
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let cache = test_cache(1 << 20, 3600);
        cache.set("k", &json!({"a": 1})).await;
        assert_eq!(cache.get("k").await, Some(json!({"a": 1})));
        assert_eq!(cache.get("absent").await, None);
    }

    #[tokio::test]
    async fn expired_entries_report_misses_and_are_deleted() {
        let cache = test_cache(1 << 20, 3600);
        cache.set_with_ttl("k", &json!("v"), Some(0)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.entries_total, 0);
        assert_eq!(stats.current_size_bytes, 0);
    }

    #[tokio::test]
    async fn cleanup_expired_reports_count() {
        let cache = test_cache(1 << 20, 3600);
        cache.set_with_ttl("a", &json!(1), Some(0)).await;
        cache.set_with_ttl("b", &json!(2), Some(0)).await;
        cache.set("c", &json!(3)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.cleanup_expired().await, 2);
        assert_eq!(cache.stats().await.entries_total, 1);
    }

    #[tokio::test]
    async fn size_accounting_matches_serialized_lengths() {
        let cache = test_cache(1 << 20, 3600);
        let a = json!({"x": "aaaa"});
        let b = json!([1, 2, 3]);
        cache.set("a", &a).await;
        cache.set("b", &b).await;

        let expected = serde_json::to_vec(&a).unwrap().len() + serde_json::to_vec(&b).unwrap().len();
        assert_eq!(cache.stats().await.current_size_bytes, expected as u64);

        cache.delete("a").await;
        let expected = serde_json::to_vec(&b).unwrap().len();
        assert_eq!(cache.stats().await.current_size_bytes, expected as u64);

        cache.clear().await;
        assert_eq!(cache.stats().await.current_size_bytes, 0);
    }

    #[tokio::test]
    async fn replacement_subtracts_old_size_first() {
        let cache = test_cache(1 << 20, 3600);
        cache.set("k", &json!("aaaaaaaaaa")).await;
        cache.set("k", &json!("b")).await;
        let expected = serde_json::to_vec(&json!("b")).unwrap().len() as u64;
        assert_eq!(cache.stats().await.current_size_bytes, expected);
        assert_eq!(cache.stats().await.entries_total, 1);
    }

    #[tokio::test]
    async fn lru_eviction_prefers_least_recently_accessed() {
        // Each "xxxxxxxx" string serializes to 10 bytes; budget fits three.
        let cache = test_cache(35, 3600);
        cache.set("a", &json!("aaaaaaaa")).await;
        cache.set("b", &json!("bbbbbbbb")).await;
        cache.set("c", &json!("cccccccc")).await;

        // Touch "a" so "b" becomes the LRU victim.
        assert!(cache.get("a").await.is_some());

        cache.set("d", &json!("dddddddd")).await;
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
        assert!(cache.get("d").await.is_some());
    }

    #[tokio::test]
    async fn untouched_entries_evict_in_insertion_order() {
        let cache = test_cache(25, 3600);
        cache.set("a", &json!("aaaaaaaa")).await;
        cache.set("b", &json!("bbbbbbbb")).await;
        cache.set("c", &json!("cccccccc")).await;
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn oversized_values_are_rejected() {
        let cache = test_cache(8, 3600);
        cache.set("big", &json!("aaaaaaaaaaaaaaaa")).await;
        assert_eq!(cache.get("big").await, None);
        assert_eq!(cache.stats().await.current_size_bytes, 0);
    }

    #[tokio::test]
    async fn stats_track_hits_and_misses() {
        let cache = test_cache(1 << 20, 3600);
        cache.set("k", &json!(1)).await;
        let _ = cache.get("k").await;
        let _ = cache.get("k").await;
        let _ = cache.get("missing").await;

        let stats = cache.stats().await;
        assert_eq!(stats.total_accesses, 3);
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache_type: CacheType::Both,
            cache_dir: Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            certificate_directories: Vec::new(),
            ..Default::default()
        };

        let cache = Cache::new(&config);
        cache.initialize().await.unwrap();
        cache.set("k", &json!({"cn": "a.example"})).await;
        let _ = cache.get("k").await;
        cache.close().await;

        let reloaded = Cache::new(&config);
        reloaded.initialize().await.unwrap();
        assert_eq!(reloaded.get("k").await, Some(json!({"cn": "a.example"})));

        let stats = reloaded.stats().await;
        // One recorded access from before the restart plus the get above.
        assert_eq!(stats.total_accesses, 2);
        assert_eq!(stats.cache_hits, 2);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache_type: CacheType::File,
            cache_dir: Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            certificate_directories: Vec::new(),
            ..Default::default()
        };
        std::fs::write(dir.path().join(CACHE_FILE_NAME), b"not json").unwrap();

        let cache = Cache::new(&config);
        cache.initialize().await.unwrap();
        assert_eq!(cache.stats().await.entries_total, 0);
        assert!(!dir.path().join(CACHE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn memory_cache_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache_type: CacheType::Memory,
            cache_dir: Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            certificate_directories: Vec::new(),
            ..Default::default()
        };
        let cache = Cache::new(&config);
        cache.initialize().await.unwrap();
        cache.set("k", &json!(1)).await;
        cache.close().await;
        assert!(!dir.path().join(CACHE_FILE_NAME).exists());
    }

    #[test]
    fn make_key_is_deterministic_and_short() {
        let a = Cache::make_key(&["cert", "/etc/ssl/a.pem", "1700000000"]);
        let b = Cache::make_key(&["cert", "/etc/ssl/a.pem", "1700000000"]);
        let c = Cache::make_key(&["cert", "/etc/ssl/a.pem", "1700000001"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
