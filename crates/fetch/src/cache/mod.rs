//! Per-chain TTL cache with stale-while-revalidate tiers.
//!
//! Entries move through three tiers by age: fresh (served directly), stale
//! (served, but the caller is responsible for triggering a refresh), and
//! expired (deleted on sight). Capacity is bounded with LRU eviction by
//! last access. A detached sweep task purges expired entries that are never
//! read again.
//!
//! The cache is in-memory and private to one chain; there is no
//! cross-process state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Default maximum number of entries per cache.
const DEFAULT_MAX_SIZE: usize = 1000;

/// Interval between background sweeps of expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Cache tier configuration.
///
/// `stale_ttl` must be strictly greater than `fresh_ttl`.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Age below which an entry is a fresh hit.
    pub fresh_ttl: Duration,
    /// Age below which an entry is still served (as a stale hit).
    pub stale_ttl: Duration,
    /// Maximum number of entries before LRU eviction.
    pub max_size: usize,
}

impl CacheConfig {
    /// Config with the default capacity.
    pub fn new(fresh_ttl: Duration, stale_ttl: Duration) -> Self {
        Self {
            fresh_ttl,
            stale_ttl,
            max_size: DEFAULT_MAX_SIZE,
        }
    }

    /// Override the entry capacity.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

/// Result of a cache lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CacheHit<T> {
    /// Entry age is within `fresh_ttl`; use the value as-is.
    Fresh(T),
    /// Entry age is past `fresh_ttl` but within `stale_ttl`; usable, but
    /// the caller should trigger a refresh.
    Stale(T),
    /// No usable entry.
    Miss,
}

impl<T> CacheHit<T> {
    /// The cached value for either hit tier.
    pub fn value(self) -> Option<T> {
        match self {
            Self::Fresh(value) | Self::Stale(value) => Some(value),
            Self::Miss => None,
        }
    }

    /// True for a fresh hit.
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }
}

#[derive(Debug)]
struct CacheEntry<T> {
    value: T,
    created_at: Instant,
    last_accessed: Instant,
}

type EntryMap<T> = HashMap<String, CacheEntry<T>>;

/// TTL cache with fresh/stale/expired tiers and LRU eviction.
///
/// All operations are synchronous and never perform I/O. The sweep task is
/// detached; `destroy` (or dropping the cache) stops it.
pub struct TtlCache<T> {
    name: String,
    entries: Arc<Mutex<EntryMap<T>>>,
    config: CacheConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + 'static> TtlCache<T> {
    /// Create a cache and start its background sweep.
    ///
    /// Outside a tokio runtime the sweep is skipped; expiry is then
    /// enforced on read only.
    ///
    /// # Panics
    ///
    /// Panics if `stale_ttl <= fresh_ttl`.
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        assert!(
            config.stale_ttl > config.fresh_ttl,
            "stale_ttl must be greater than fresh_ttl"
        );

        let name = name.into();
        let entries: Arc<Mutex<EntryMap<T>>> = Arc::new(Mutex::new(HashMap::new()));

        let sweeper = Handle::try_current().ok().map(|rt| {
            let entries = Arc::clone(&entries);
            let stale_ttl = config.stale_ttl;
            let sweep_name = name.clone();
            rt.spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                // First tick completes immediately.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let purged = purge_expired(&entries, stale_ttl);
                    if purged > 0 {
                        debug!("cache '{}': sweep purged {} expired entries", sweep_name, purged);
                    }
                }
            })
        });

        Self {
            name,
            entries,
            config,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Look up `key`, classifying the entry by age.
    ///
    /// Entries older than `stale_ttl` are deleted and reported as a miss;
    /// any returned hit refreshes the entry's last-access time.
    pub fn get(&self, key: &str) -> CacheHit<T> {
        let mut entries = self.lock_entries();

        let age = match entries.get(key) {
            Some(entry) => entry.created_at.elapsed(),
            None => return CacheHit::Miss,
        };

        if age > self.config.stale_ttl {
            entries.remove(key);
            debug!("cache '{}': '{}' expired ({}ms old)", self.name, key, age.as_millis());
            return CacheHit::Miss;
        }

        if let Some(entry) = entries.get_mut(key) {
            entry.last_accessed = Instant::now();
            let value = entry.value.clone();
            if age <= self.config.fresh_ttl {
                CacheHit::Fresh(value)
            } else {
                CacheHit::Stale(value)
            }
        } else {
            CacheHit::Miss
        }
    }

    /// Insert or overwrite `key`, evicting the least-recently-accessed
    /// entry when inserting a new key at capacity.
    pub fn set(&self, key: &str, value: T) {
        let mut entries = self.lock_entries();

        if !entries.contains_key(key) && entries.len() >= self.config.max_size {
            // Linear scan is fine at the bounded sizes this cache runs at.
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                debug!("cache '{}': evicting '{}' at capacity {}", self.name, oldest, self.config.max_size);
                entries.remove(&oldest);
            }
        }

        let now = Instant::now();
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                last_accessed: now,
            },
        );
    }

    /// Remove `key`. Returns whether an entry existed.
    pub fn delete(&self, key: &str) -> bool {
        self.lock_entries().remove(key).is_some()
    }

    /// Current number of entries, expired ones included until swept.
    pub fn size(&self) -> usize {
        self.lock_entries().len()
    }

    /// Stop the sweep task and clear all entries.
    pub fn destroy(&self) {
        if let Some(handle) = self.take_sweeper() {
            handle.abort();
        }
        self.lock_entries().clear();
    }

    fn lock_entries(&self) -> MutexGuard<'_, EntryMap<T>> {
        lock_map(&self.entries)
    }

    fn take_sweeper(&self) -> Option<JoinHandle<()>> {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| {
                warn!("cache '{}': sweeper mutex was poisoned, recovering", self.name);
                poisoned.into_inner()
            })
            .take()
    }

    #[cfg(test)]
    fn purge_now(&self) -> usize {
        purge_expired(&self.entries, self.config.stale_ttl)
    }
}

impl<T> Drop for TtlCache<T> {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

/// Lock the entry map, recovering from poison. Losing a cache write on a
/// panicked thread is harmless next to taking the process down.
fn lock_map<T>(entries: &Mutex<EntryMap<T>>) -> MutexGuard<'_, EntryMap<T>> {
    entries.lock().unwrap_or_else(|poisoned| {
        warn!("cache entry mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Drop every entry older than `stale_ttl`, returning how many went.
fn purge_expired<T>(entries: &Mutex<EntryMap<T>>, stale_ttl: Duration) -> usize {
    let mut entries = lock_map(entries);
    let before = entries.len();
    entries.retain(|_, entry| entry.created_at.elapsed() <= stale_ttl);
    before - entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn quick_config() -> CacheConfig {
        CacheConfig::new(Duration::from_millis(40), Duration::from_millis(120))
    }

    #[test]
    #[should_panic(expected = "stale_ttl must be greater than fresh_ttl")]
    fn test_rejects_inverted_ttls() {
        let config = CacheConfig::new(Duration::from_secs(5), Duration::from_secs(1));
        let _cache: TtlCache<u32> = TtlCache::new("bad", config);
    }

    #[test]
    fn test_fresh_hit_returns_stored_value() {
        let cache = TtlCache::new("quotes", quick_config());
        cache.set("sh600000", 42u32);

        match cache.get("sh600000") {
            CacheHit::Fresh(value) => assert_eq!(value, 42),
            other => panic!("expected fresh hit, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_hit_after_fresh_window() {
        let cache = TtlCache::new("quotes", quick_config());
        cache.set("sh600000", 42u32);

        sleep(Duration::from_millis(60));

        match cache.get("sh600000") {
            CacheHit::Stale(value) => assert_eq!(value, 42),
            other => panic!("expected stale hit, got {:?}", other),
        }
    }

    #[test]
    fn test_expired_entry_is_removed_on_read() {
        let cache = TtlCache::new("quotes", quick_config());
        cache.set("sh600000", 42u32);
        assert_eq!(cache.size(), 1);

        sleep(Duration::from_millis(140));

        assert_eq!(cache.get("sh600000"), CacheHit::Miss);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_overwrite_resets_age() {
        let cache = TtlCache::new("quotes", quick_config());
        cache.set("sh600000", 1u32);

        sleep(Duration::from_millis(60));
        cache.set("sh600000", 2u32);

        match cache.get("sh600000") {
            CacheHit::Fresh(value) => assert_eq!(value, 2),
            other => panic!("expected fresh hit after overwrite, got {:?}", other),
        }
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let config = quick_config().with_max_size(2);
        let cache = TtlCache::new("quotes", config);

        cache.set("a", 1u32);
        sleep(Duration::from_millis(5));
        cache.set("b", 2u32);
        sleep(Duration::from_millis(5));

        // Touch "a" so "b" becomes the least recently accessed.
        assert!(cache.get("a").is_fresh());
        cache.set("c", 3u32);

        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get("b"), CacheHit::Miss);
        assert!(cache.get("a").is_fresh());
        assert!(cache.get("c").is_fresh());
    }

    #[test]
    fn test_delete() {
        let cache = TtlCache::new("quotes", quick_config());
        cache.set("a", 1u32);

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.get("a"), CacheHit::Miss);
    }

    #[test]
    fn test_purge_removes_only_expired() {
        let cache = TtlCache::new("quotes", quick_config());
        cache.set("old", 1u32);
        sleep(Duration::from_millis(140));
        cache.set("new", 2u32);

        assert_eq!(cache.purge_now(), 1);
        assert_eq!(cache.size(), 1);
        assert!(cache.get("new").is_fresh());
    }

    #[test]
    fn test_destroy_clears_entries() {
        let cache = TtlCache::new("quotes", quick_config());
        cache.set("a", 1u32);
        cache.set("b", 2u32);

        cache.destroy();
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_started_inside_runtime() {
        let cache: TtlCache<u32> = TtlCache::new("quotes", quick_config());
        assert!(cache.sweeper.lock().unwrap().is_some());
        cache.destroy();
        assert!(cache.sweeper.lock().unwrap().is_none());
    }
}
