use crate::core::features::MultiLevelFeature;
use crate::core::hash::FingerprintSet;
use crate::core::quality::QualityScore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKind {
    Fingerprints,
    Features,
    Quality,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Fingerprints => "fingerprints",
            CacheKind::Features => "features",
            CacheKind::Quality => "quality",
        }
    }
}

impl FromStr for CacheKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fingerprints" => Ok(CacheKind::Fingerprints),
            "features" => Ok(CacheKind::Features),
            "quality" => Ok(CacheKind::Quality),
            other => Err(CacheError::InvalidKey(format!("unknown kind '{}'", other))),
        }
    }
}

/// `photoId:lastModified:size:kind`. A changed file gets a new key, so stale
/// entries simply stop being hit and age out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CacheKey {
    pub photo_id: String,
    pub last_modified: i64,
    pub size: u64,
    pub kind: CacheKind,
}

impl CacheKey {
    pub fn new(photo_id: impl Into<String>, last_modified: i64, size: u64, kind: CacheKind) -> Self {
        Self {
            photo_id: photo_id.into(),
            last_modified,
            size,
            kind,
        }
    }

    pub fn with_kind(&self, kind: CacheKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.photo_id,
            self.last_modified,
            self.size,
            self.kind.as_str()
        )
    }
}

impl FromStr for CacheKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Photo ids are paths and may contain ':' themselves
        let mut parts = s.rsplitn(4, ':');
        let (Some(kind), Some(size), Some(modified), Some(photo_id)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CacheError::InvalidKey(s.to_string()));
        };
        Ok(Self {
            photo_id: photo_id.to_string(),
            last_modified: modified
                .parse()
                .map_err(|_| CacheError::InvalidKey(s.to_string()))?,
            size: size
                .parse()
                .map_err(|_| CacheError::InvalidKey(s.to_string()))?,
            kind: kind.parse()?,
        })
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for CacheKey {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum CachePayload {
    Fingerprints(FingerprintSet),
    Features(MultiLevelFeature),
    Quality(QualityScore),
}

impl CachePayload {
    pub fn kind(&self) -> CacheKind {
        match self {
            CachePayload::Fingerprints(_) => CacheKind::Fingerprints,
            CachePayload::Features(_) => CacheKind::Features,
            CachePayload::Quality(_) => CacheKind::Quality,
        }
    }

    /// Rough heap footprint, for the memory monitor.
    pub fn approx_bytes(&self) -> usize {
        let fingerprints = |set: &FingerprintSet| set.iter().map(|f| f.len() / 8 + 16).sum::<usize>();
        match self {
            CachePayload::Fingerprints(set) => fingerprints(set),
            CachePayload::Features(feature) => {
                let low = feature.low.as_ref().map_or(0, fingerprints);
                let mid = feature.mid.as_ref().map_or(0, |m| m.to_vector().len() * 4);
                let high = feature.high.as_ref().map_or(0, |h| h.len() * 4);
                low + mid + high + feature.id.len() + feature.metadata.content_hash.len()
            }
            CachePayload::Quality(score) => {
                32 + score.technical_issues.iter().map(String::len).sum::<usize>()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: CachePayload,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub usage_count: u64,
    /// Logical access clock; wall time is too coarse to order accesses.
    #[serde(skip)]
    tick: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub enabled: bool,
    pub max_entries: usize,
    pub policy: EvictionPolicy,
    /// Entries older than this many seconds are dropped on access.
    pub ttl_secs: Option<u64>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            policy: EvictionPolicy::Lru,
            ttl_secs: None,
        }
    }
}

/// Persistence backend for the cache.
pub trait CacheStore: Send {
    fn load(&self) -> Result<Vec<CacheEntry>, CacheError>;
    fn save(&self, entries: &[CacheEntry]) -> Result<(), CacheError>;
    fn describe(&self) -> String;
}

/// Whole-cache JSON document on disk.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CacheError {
        CacheError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CacheStore for JsonFileStore {
    fn load(&self) -> Result<Vec<CacheEntry>, CacheError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|e| self.io_error(e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| CacheError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, entries: &[CacheEntry]) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        // Write beside the target and rename so a crash never leaves half a file
        let staging = self.path.with_extension("json.tmp");
        let file = File::create(&staging).map_err(|e| self.io_error(e))?;
        serde_json::to_writer(BufWriter::new(file), entries).map_err(|source| CacheError::Corrupt {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &self.path).map_err(|e| self.io_error(e))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub persistent: bool,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Keys in eviction order for `policy`, first victim first.
    fn victims(&self, policy: EvictionPolicy) -> Vec<CacheKey> {
        let mut entries: Vec<&CacheEntry> = self.entries.values().collect();
        match policy {
            EvictionPolicy::Lru => entries.sort_by_key(|e| e.tick),
            EvictionPolicy::Lfu => entries.sort_by_key(|e| (e.usage_count, e.tick)),
        }
        entries.into_iter().map(|e| e.key.clone()).collect()
    }
}

/// Memoises per-photo fingerprints, features and quality scores.
pub struct CacheLayer {
    options: CacheOptions,
    inner: Mutex<CacheInner>,
    store: Mutex<Option<Box<dyn CacheStore>>>,
}

impl CacheLayer {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(CacheInner::default()),
            store: Mutex::new(None),
        }
    }

    /// Loads existing entries from `store`. If that fails the cache runs in
    /// memory only for the rest of the session.
    pub fn with_store(options: CacheOptions, store: Box<dyn CacheStore>) -> Self {
        let cache = Self::new(options);
        match store.load() {
            Ok(mut entries) => {
                entries.sort_by_key(|e| e.last_accessed);
                let mut inner = cache.lock_inner();
                for mut entry in entries {
                    entry.tick = inner.next_tick();
                    inner.entries.insert(entry.key.clone(), entry);
                }
                log::info!(
                    "Loaded {} cache entries from {}",
                    inner.entries.len(),
                    store.describe()
                );
                drop(inner);
                *cache.lock_store() = Some(store);
                cache.evict_expired();
                cache.enforce_capacity();
            }
            Err(e) => {
                log::warn!("Cache unavailable, continuing in memory only: {}", e);
            }
        }
        cache
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachePayload> {
        if !self.options.enabled {
            return None;
        }
        let now = Utc::now();
        let mut inner = self.lock_inner();
        let expired = inner
            .entries
            .get(key)
            .map(|entry| self.is_expired(entry, now));
        match expired {
            None => {
                inner.misses += 1;
                None
            }
            Some(true) => {
                inner.entries.remove(key);
                inner.evictions += 1;
                inner.misses += 1;
                None
            }
            Some(false) => {
                let tick = inner.next_tick();
                inner.hits += 1;
                let entry = inner.entries.get_mut(key)?;
                entry.usage_count += 1;
                entry.last_accessed = now;
                entry.tick = tick;
                Some(entry.payload.clone())
            }
        }
    }

    pub fn insert(&self, key: CacheKey, payload: CachePayload) {
        if !self.options.enabled || self.options.max_entries == 0 {
            return;
        }
        let now = Utc::now();
        {
            let mut inner = self.lock_inner();
            let tick = inner.next_tick();
            inner.entries.insert(
                key.clone(),
                CacheEntry {
                    key,
                    payload,
                    created_at: now,
                    last_accessed: now,
                    usage_count: 1,
                    tick,
                },
            );
        }
        self.enforce_capacity();
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CachePayload> {
        self.lock_inner().entries.remove(key).map(|e| e.payload)
    }

    /// Drops every entry of `photo_id`, whatever its version or kind.
    pub fn remove_photo(&self, photo_id: &str) -> usize {
        let mut inner = self.lock_inner();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| key.photo_id != photo_id);
        before - inner.entries.len()
    }

    pub fn evict_expired(&self) -> usize {
        if self.options.ttl_secs.is_none() {
            return 0;
        }
        let now = Utc::now();
        let mut inner = self.lock_inner();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !self.is_expired(entry, now));
        let removed = before - inner.entries.len();
        inner.evictions += removed as u64;
        removed
    }

    /// Evicts `fraction` of the entries in policy order. Used to give memory
    /// back under pressure.
    pub fn evict_idle(&self, fraction: f64) -> usize {
        let mut inner = self.lock_inner();
        let count = (inner.entries.len() as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize;
        let victims = inner.victims(self.options.policy);
        for key in victims.iter().take(count) {
            inner.entries.remove(key);
        }
        inner.evictions += count as u64;
        if count > 0 {
            log::debug!("Evicted {} idle cache entries", count);
        }
        count
    }

    /// Writes the cache to its store. Returns whether anything was persisted.
    pub fn flush(&self) -> bool {
        let entries: Vec<CacheEntry> = self.lock_inner().entries.values().cloned().collect();
        let mut store = self.lock_store();
        let Some(backend) = store.as_ref() else {
            return false;
        };
        match backend.save(&entries) {
            Ok(()) => {
                log::debug!("Persisted {} cache entries to {}", entries.len(), backend.describe());
                true
            }
            Err(e) => {
                log::warn!("Cache persistence failed, continuing in memory only: {}", e);
                *store = None;
                false
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock_inner();
        inner.entries.clear();
        drop(inner);
        self.flush();
    }

    pub fn len(&self) -> usize {
        self.lock_inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_persistent(&self) -> bool {
        self.lock_store().is_some()
    }

    pub fn approx_bytes(&self) -> usize {
        self.lock_inner()
            .entries
            .values()
            .map(|e| e.payload.approx_bytes() + e.key.photo_id.len() + 64)
            .sum()
    }

    pub fn stats(&self) -> CacheStats {
        let persistent = self.is_persistent();
        let inner = self.lock_inner();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            persistent,
        }
    }

    fn enforce_capacity(&self) {
        let mut inner = self.lock_inner();
        let excess = inner.entries.len().saturating_sub(self.options.max_entries);
        if excess == 0 {
            return;
        }
        let victims = inner.victims(self.options.policy);
        for key in victims.iter().take(excess) {
            inner.entries.remove(key);
        }
        inner.evictions += excess as u64;
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match self.options.ttl_secs {
            Some(ttl) => now - entry.created_at > Duration::seconds(ttl as i64),
            None => false,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_store(&self) -> MutexGuard<'_, Option<Box<dyn CacheStore>>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CacheLayer {
    fn drop(&mut self) {
        if self.is_persistent() {
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::{Fingerprint, HashAlgorithm};
    use tempfile::TempDir;

    fn key(id: &str, kind: CacheKind) -> CacheKey {
        CacheKey::new(id, 1_700_000_000, 2048, kind)
    }

    fn quality(overall: f64) -> CachePayload {
        CachePayload::Quality(QualityScore {
            overall,
            sharpness: 0.5,
            brightness: 0.5,
            contrast: 0.5,
            technical_issues: Vec::new(),
        })
    }

    fn options(max_entries: usize, policy: EvictionPolicy) -> CacheOptions {
        CacheOptions {
            max_entries,
            policy,
            ..CacheOptions::default()
        }
    }

    #[test]
    fn test_key_format_round_trips() {
        let key = CacheKey::new("/photos/a:b.jpg", 42, 7, CacheKind::Features);
        assert_eq!(key.to_string(), "/photos/a:b.jpg:42:7:features");
        assert_eq!(key.to_string().parse::<CacheKey>().unwrap(), key);
        assert!("no-colons".parse::<CacheKey>().is_err());
        assert!("a:1:2:thumbnails".parse::<CacheKey>().is_err());
    }

    #[test]
    fn test_get_and_insert() {
        let cache = CacheLayer::new(CacheOptions::default());
        assert!(cache.get(&key("a", CacheKind::Quality)).is_none());
        cache.insert(key("a", CacheKind::Quality), quality(0.7));
        assert_eq!(cache.get(&key("a", CacheKind::Quality)), Some(quality(0.7)));
        // Same photo, different kind
        assert!(cache.get(&key("a", CacheKind::Features)).is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 2));
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let cache = CacheLayer::new(options(2, EvictionPolicy::Lru));
        cache.insert(key("a", CacheKind::Quality), quality(0.1));
        cache.insert(key("b", CacheKind::Quality), quality(0.2));
        cache.get(&key("a", CacheKind::Quality));
        cache.insert(key("c", CacheKind::Quality), quality(0.3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("b", CacheKind::Quality)).is_none());
        assert!(cache.get(&key("a", CacheKind::Quality)).is_some());
    }

    #[test]
    fn test_lfu_evicts_least_frequently_used() {
        let cache = CacheLayer::new(options(2, EvictionPolicy::Lfu));
        cache.insert(key("a", CacheKind::Quality), quality(0.1));
        cache.insert(key("b", CacheKind::Quality), quality(0.2));
        cache.get(&key("a", CacheKind::Quality));
        cache.get(&key("a", CacheKind::Quality));
        cache.get(&key("b", CacheKind::Quality));
        cache.insert(key("c", CacheKind::Quality), quality(0.3));

        assert!(cache.get(&key("c", CacheKind::Quality)).is_none());
        assert!(cache.get(&key("a", CacheKind::Quality)).is_some());
        assert!(cache.get(&key("b", CacheKind::Quality)).is_some());
    }

    #[test]
    fn test_usage_starts_at_one_and_counts_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entries.json");
        let cache = CacheLayer::with_store(CacheOptions::default(), Box::new(JsonFileStore::new(&path)));
        cache.insert(key("a", CacheKind::Quality), quality(0.1));
        cache.get(&key("a", CacheKind::Quality));
        cache.insert(key("b", CacheKind::Quality), quality(0.2));
        assert!(cache.flush());

        let mut usage: Vec<(String, u64)> = JsonFileStore::new(&path)
            .load()
            .unwrap()
            .into_iter()
            .map(|e| (e.key.photo_id.clone(), e.usage_count))
            .collect();
        usage.sort();
        assert_eq!(usage, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = CacheLayer::new(CacheOptions {
            ttl_secs: Some(0),
            ..CacheOptions::default()
        });
        cache.insert(key("a", CacheKind::Quality), quality(0.1));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_photo_and_evict_idle() {
        let cache = CacheLayer::new(CacheOptions::default());
        for kind in [CacheKind::Fingerprints, CacheKind::Features, CacheKind::Quality] {
            cache.insert(key("a", kind), quality(0.1));
        }
        for id in ["b", "c", "d"] {
            cache.insert(key(id, CacheKind::Quality), quality(0.1));
        }
        assert_eq!(cache.remove_photo("a"), 3);
        assert_eq!(cache.evict_idle(0.5), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = CacheLayer::new(CacheOptions {
            enabled: false,
            ..CacheOptions::default()
        });
        cache.insert(key("a", CacheKind::Quality), quality(0.1));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_file_store_persists_between_sessions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache").join("entries.json");
        let mut set = FingerprintSet::default();
        set.set(Fingerprint::from_bits(HashAlgorithm::Average, (0..64).map(|i| i % 3 == 0)));

        {
            let cache = CacheLayer::with_store(CacheOptions::default(), Box::new(JsonFileStore::new(&path)));
            cache.insert(key("a", CacheKind::Fingerprints), CachePayload::Fingerprints(set.clone()));
            assert!(cache.flush());
        }

        let cache = CacheLayer::with_store(CacheOptions::default(), Box::new(JsonFileStore::new(&path)));
        assert!(cache.is_persistent());
        assert_eq!(
            cache.get(&key("a", CacheKind::Fingerprints)),
            Some(CachePayload::Fingerprints(set))
        );
    }

    #[test]
    fn test_corrupt_store_falls_back_to_memory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entries.json");
        fs::write(&path, "{ not json").unwrap();

        let cache = CacheLayer::with_store(CacheOptions::default(), Box::new(JsonFileStore::new(&path)));
        assert!(!cache.is_persistent());
        cache.insert(key("a", CacheKind::Quality), quality(0.4));
        assert!(cache.get(&key("a", CacheKind::Quality)).is_some());
        assert!(!cache.flush());
    }

    #[test]
    fn test_unwritable_store_is_dropped() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes the final rename fail
        let path = dir.path().join("entries.json");
        fs::create_dir_all(path.join("occupied")).unwrap();

        let cache = CacheLayer::with_store(CacheOptions::default(), Box::new(JsonFileStore::new(&path)));
        cache.insert(key("a", CacheKind::Quality), quality(0.4));
        assert!(!cache.flush());
        assert!(!cache.is_persistent());
        assert_eq!(cache.len(), 1);
    }
}
