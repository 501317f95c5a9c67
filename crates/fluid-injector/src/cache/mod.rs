//! Bounded in-memory caches with a per-entry time to live.
//!
//! [`TtlCache`] is the generic building block: a least recently used cache
//! whose entries additionally expire a fixed duration after insertion. It is
//! internally synchronized, callers share it behind an [`Arc`](std::sync::Arc)
//! without any further locking.
use std::{
    fmt,
    hash::Hash,
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use lru::LruCache;
use tracing::debug;

pub mod fuse_template;
pub mod runtime_info;

pub use fuse_template::{FuseSidecarOptions, FuseTemplateCache, TemplateProvider};
pub use runtime_info::{
    CachedDatasetResolver, DatasetResolver, LookupError, RuntimeInfo, RuntimeInfoCache,
};

/// Why an entry left a [`TtlCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionCause {
    /// The entry outlived its time to live.
    Expired,

    /// The cache was full and the entry was the least recently used one.
    Capacity,

    /// The entry was removed explicitly.
    Invalidated,
}

pub type EvictionCallback<K, V> = Box<dyn Fn(&K, &V, EvictionCause) + Send + Sync>;

/// Capacity and time to live of a [`TtlCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries. If this threshold is reached the least
    /// recently used entry is evicted. Zero is treated as one.
    pub capacity: usize,

    /// Time to live per entry, measured from insertion.
    pub entry_time_to_live: Duration,
}

impl CacheConfig {
    pub const DEFAULT_CAPACITY: usize = 1000;
    pub const DEFAULT_ENTRY_TIME_TO_LIVE: Duration = Duration::from_secs(30);
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: Self::DEFAULT_CAPACITY,
            entry_time_to_live: Self::DEFAULT_ENTRY_TIME_TO_LIVE,
        }
    }
}

struct Entry<V> {
    value: V,

    /// [`None`] if the time to live exceeds what [`Instant`] can represent.
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// Least recently used cache with a per-entry time to live.
///
/// [`TtlCache::add`] never replaces a live entry: the first writer wins until
/// the entry expires or gets evicted.
pub struct TtlCache<K, V> {
    name: &'static str,
    entry_time_to_live: Duration,
    entries: Mutex<LruCache<K, Entry<V>>>,
    on_eviction: Option<EvictionCallback<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Creates an empty cache. The `name` shows up in the eviction logs.
    pub fn new(name: &'static str, config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            name,
            entry_time_to_live: config.entry_time_to_live,
            entries: Mutex::new(LruCache::new(capacity)),
            on_eviction: None,
        }
    }

    /// Registers a callback which observes every eviction.
    ///
    /// The callback runs while the cache is locked, it must not access the
    /// cache itself.
    pub fn with_eviction_callback(
        mut self,
        callback: impl Fn(&K, &V, EvictionCause) + Send + Sync + 'static,
    ) -> Self {
        self.on_eviction = Some(Box::new(callback));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns a copy of the live value stored under `key`. Expired entries
    /// are purged on access and reported as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();

        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }

        if let Some((key, entry)) = entries.pop_entry(key) {
            self.evicted(&key, &entry.value, EvictionCause::Expired);
        }

        None
    }

    /// Stores `value` under `key` unless a live entry already exists.
    /// Returns whether the value was stored.
    pub fn add(&self, key: K, value: V) -> bool {
        let mut entries = self.lock();
        let now = Instant::now();

        match entries.peek(&key).map(|entry| entry.is_live(now)) {
            Some(true) => return false,
            Some(false) => {
                if let Some((key, entry)) = entries.pop_entry(&key) {
                    self.evicted(&key, &entry.value, EvictionCause::Expired);
                }
            }
            None => {}
        }

        let entry = Entry {
            value,
            expires_at: now.checked_add(self.entry_time_to_live),
        };
        if let Some((key, entry)) = entries.push(key, entry) {
            self.evicted(&key, &entry.value, EvictionCause::Capacity);
        }

        true
    }

    /// Removes the entry stored under `key`, returning its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let (key, entry) = self.lock().pop_entry(key)?;
        self.evicted(&key, &entry.value, EvictionCause::Invalidated);

        Some(entry.value)
    }

    /// Returns the number of stored entries, including expired entries which
    /// were not purged yet.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, Entry<V>>> {
        // Entries stay consistent even if a holder panicked.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evicted(&self, key: &K, value: &V, cause: EvictionCause) {
        debug!(cache.name = self.name, ?cause, "evicted cache entry");

        if let Some(on_eviction) = &self.on_eviction {
            on_eviction(key, value, cause);
        }
    }
}

impl<K, V> fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("entry_time_to_live", &self.entry_time_to_live)
            .field("has_eviction_callback", &self.on_eviction.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        thread,
    };

    use super::*;

    fn config(capacity: usize, entry_time_to_live: Duration) -> CacheConfig {
        CacheConfig {
            capacity,
            entry_time_to_live,
        }
    }

    fn recording_cache(
        capacity: usize,
        entry_time_to_live: Duration,
    ) -> (TtlCache<&'static str, u32>, Arc<Mutex<Vec<(&'static str, EvictionCause)>>>) {
        let evictions = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&evictions);

        let cache = TtlCache::new("test", config(capacity, entry_time_to_live))
            .with_eviction_callback(move |key, _, cause| recorded.lock().unwrap().push((*key, cause)));

        (cache, evictions)
    }

    #[test]
    fn first_writer_wins() {
        let cache = TtlCache::new("test", CacheConfig::default());

        assert!(cache.add("key", 1));
        assert!(!cache.add("key", 2));
        assert_eq!(cache.get(&"key"), Some(1));
    }

    #[test]
    fn entries_expire() {
        let (cache, evictions) = recording_cache(10, Duration::from_millis(50));

        cache.add("key", 1);
        thread::sleep(Duration::from_millis(100));

        assert_eq!(cache.get(&"key"), None);
        assert!(cache.is_empty());
        assert_eq!(*evictions.lock().unwrap(), [("key", EvictionCause::Expired)]);
    }

    #[test]
    fn expired_entries_are_replaced() {
        let cache = TtlCache::new("test", config(10, Duration::from_millis(50)));

        cache.add("key", 1);
        thread::sleep(Duration::from_millis(100));

        assert!(cache.add("key", 2));
        assert_eq!(cache.get(&"key"), Some(2));
    }

    #[test]
    fn unrepresentable_time_to_live_never_expires() {
        let cache = TtlCache::new("test", config(10, Duration::MAX));

        assert!(cache.add("key", 1));
        assert!(!cache.add("key", 2));
        assert_eq!(cache.get(&"key"), Some(1));
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let (cache, evictions) = recording_cache(2, Duration::from_secs(60));

        cache.add("a", 1);
        cache.add("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.add("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(*evictions.lock().unwrap(), [("b", EvictionCause::Capacity)]);
    }

    #[test]
    fn remove_reports_invalidation() {
        let (cache, evictions) = recording_cache(10, Duration::from_secs(60));

        cache.add("key", 1);
        assert_eq!(cache.remove(&"key"), Some(1));
        assert_eq!(cache.remove(&"key"), None);
        assert_eq!(*evictions.lock().unwrap(), [("key", EvictionCause::Invalidated)]);
    }

    #[test]
    fn zero_capacity_holds_one_entry() {
        let cache = TtlCache::new("test", config(0, Duration::from_secs(60)));

        cache.add("a", 1);
        cache.add("b", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[test]
    fn concurrent_writers_agree_on_one_value() {
        let cache = Arc::new(TtlCache::new("test", CacheConfig::default()));

        let observed: Vec<u32> = (0..8)
            .map(|value| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    cache.add("key", value);
                    cache.get(&"key").unwrap()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert!(observed.iter().all(|value| *value == observed[0]));
    }
}
