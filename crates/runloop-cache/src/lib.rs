#![doc = r#"# runloop-cache

A bounded, thread-safe LRU cache with a pluggable size metric and an
optional miss-fill hook.

Every `get` promotes its entry to most-recently-used. When an insertion
pushes the accounted size past the bound, least-recently-used entries are
evicted until it fits again. The accounting unit is whatever the delegate's
`size_of` returns; the default counts entries.

```
use std::sync::Arc;
use runloop_cache::LruCache;

let cache: LruCache<&str, u32> = LruCache::new(2);
cache.put("a", 1);
cache.put("b", 2);
cache.get(&"a");
cache.put("c", 3); // evicts "b", the least recently used
assert_eq!(cache.get(&"b"), None);
assert_eq!(cache.get(&"a"), Some(1));
```
"#]

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

/// Customization points for an [`LruCache`].
///
/// All methods run with the cache lock released, so they may call back
/// into the same cache.
pub trait CacheDelegate<K, V>: Send + Sync {
    /// The size of one entry in the cache's accounting unit. Must stay
    /// stable for the lifetime of the entry; the default counts entries.
    fn size_of(&self, _key: &K, _value: &V) -> usize {
        1
    }

    /// Computes a value after a miss, or `None` when misses stay misses.
    fn create(&self, _key: &K) -> Option<V> {
        None
    }

    /// Observes every removal.
    ///
    /// `evicted` is true when the entry was removed to make space; false
    /// for explicit removal or replacement. `new_value` is the replacement
    /// when one exists.
    fn entry_removed(&self, _evicted: bool, _key: &K, _old_value: V, _new_value: Option<&V>) {}
}

struct DefaultDelegate;

impl<K, V> CacheDelegate<K, V> for DefaultDelegate {}

struct Entry<V> {
    value: V,
    size: usize,
    /// Access stamp; larger means more recently used.
    used: u64,
}

struct CacheState<K, V> {
    map: HashMap<K, Entry<V>>,
    size: usize,
    max_size: usize,
    next_stamp: u64,
    put_count: u64,
    create_count: u64,
    eviction_count: u64,
    hit_count: u64,
    miss_count: u64,
}

impl<K: Eq + Hash + Clone, V> CacheState<K, V> {
    fn touch(&mut self, key: &K) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        if let Some(entry) = self.map.get_mut(key) {
            entry.used = stamp;
        }
    }

    /// The least recently used key, if any.
    fn eldest(&self) -> Option<K> {
        self.map
            .iter()
            .min_by_key(|(_, entry)| entry.used)
            .map(|(key, _)| key.clone())
    }
}

/// A bounded LRU cache; see the crate docs for semantics.
pub struct LruCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    delegate: Arc<dyn CacheDelegate<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// A cache bounded to `max_size` entries (with the default delegate) or
    /// accounting units (with a custom `size_of`).
    ///
    /// # Panics
    ///
    /// Panics if `max_size` is zero.
    pub fn new(max_size: usize) -> Self {
        Self::with_delegate(max_size, Arc::new(DefaultDelegate))
    }

    /// A cache using `delegate` for sizing, miss fills and removal
    /// notifications.
    pub fn with_delegate(max_size: usize, delegate: Arc<dyn CacheDelegate<K, V>>) -> Self {
        assert!(max_size > 0, "max_size must be positive");
        Self {
            state: Mutex::new(CacheState {
                map: HashMap::new(),
                size: 0,
                max_size,
                next_stamp: 0,
                put_count: 0,
                create_count: 0,
                eviction_count: 0,
                hit_count: 0,
                miss_count: 0,
            }),
            delegate,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().expect("cache mutex poisoned")
    }

    /// Returns the cached value for `key`, promoting it to most recently
    /// used, or consults the delegate's `create` on a miss.
    ///
    /// When `create` runs, the lock is released; if a racing `put` inserted
    /// a value for the same key in the meantime, the raced-in value wins
    /// and the created one is discarded through `entry_removed`.
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let mut state = self.lock();
            if let Some(entry) = state.map.get(key) {
                let value = entry.value.clone();
                state.hit_count += 1;
                state.touch(key);
                return Some(value);
            }
            state.miss_count += 1;
        }

        let created = self.delegate.create(key)?;

        let raced = {
            let mut state = self.lock();
            state.create_count += 1;
            if let Some(existing) = state.map.get(key) {
                // A concurrent put or create beat us; keep its value.
                let raced = existing.value.clone();
                state.touch(key);
                Some(raced)
            } else {
                let size = self.delegate.size_of(key, &created);
                let stamp = state.next_stamp;
                state.next_stamp += 1;
                state.size += size;
                state.map.insert(
                    key.clone(),
                    Entry {
                        value: created.clone(),
                        size,
                        used: stamp,
                    },
                );
                None
            }
        };

        match raced {
            Some(raced) => {
                self.delegate
                    .entry_removed(false, key, created, Some(&raced));
                Some(raced)
            }
            None => {
                self.trim_to_size(self.max_size());
                Some(created)
            }
        }
    }

    /// Caches `value` for `key`, promoting it to most recently used.
    /// Returns the previous value, if any.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let size = self.delegate.size_of(&key, &value);
        let previous = {
            let mut state = self.lock();
            state.put_count += 1;
            state.size += size;
            let stamp = state.next_stamp;
            state.next_stamp += 1;
            let previous = state.map.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    size,
                    used: stamp,
                },
            );
            if let Some(previous) = &previous {
                state.size -= previous.size;
            }
            previous
        };

        let old = previous.map(|entry| entry.value);
        if let Some(old) = &old {
            self.delegate
                .entry_removed(false, &key, old.clone(), Some(&value));
        }
        self.trim_to_size(self.max_size());
        old
    }

    /// Removes the entry for `key`, returning its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = {
            let mut state = self.lock();
            let removed = state.map.remove(key);
            if let Some(entry) = &removed {
                state.size -= entry.size;
            }
            removed
        };
        let value = removed.map(|entry| entry.value)?;
        self.delegate
            .entry_removed(false, key, value.clone(), None);
        Some(value)
    }

    /// Changes the bound, evicting until the contents fit.
    pub fn resize(&self, max_size: usize) {
        assert!(max_size > 0, "max_size must be positive");
        self.lock().max_size = max_size;
        self.trim_to_size(max_size);
    }

    /// Evicts least-recently-used entries until `size <= max_size`.
    ///
    /// Each eviction is reported through `entry_removed(true, ...)` with
    /// the lock released.
    pub fn trim_to_size(&self, max_size: usize) {
        loop {
            let (key, value) = {
                let mut state = self.lock();
                if state.size != 0 && state.map.is_empty() {
                    panic!("size_of delegate is reporting inconsistent results");
                }
                if state.size <= max_size {
                    break;
                }
                let Some(key) = state.eldest() else {
                    break;
                };
                let entry = state.map.remove(&key).expect("eldest key present");
                state.size -= entry.size;
                state.eviction_count += 1;
                (key, entry.value)
            };
            self.delegate.entry_removed(true, &key, value, None);
        }
    }

    /// Evicts everything, reporting each entry through `entry_removed`.
    pub fn evict_all(&self) {
        self.trim_to_size(0);
    }

    /// The accounted size of the current contents.
    pub fn size(&self) -> usize {
        self.lock().size
    }

    /// The current bound.
    pub fn max_size(&self) -> usize {
        self.lock().max_size
    }

    pub fn hit_count(&self) -> u64 {
        self.lock().hit_count
    }

    pub fn miss_count(&self) -> u64 {
        self.lock().miss_count
    }

    pub fn put_count(&self) -> u64 {
        self.lock().put_count
    }

    /// How many times `create` produced a value.
    pub fn create_count(&self) -> u64 {
        self.lock().create_count
    }

    pub fn eviction_count(&self) -> u64 {
        self.lock().eviction_count
    }

    /// A copy of the contents ordered least to most recently used.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let state = self.lock();
        let mut entries: Vec<_> = state
            .map
            .iter()
            .map(|(key, entry)| (entry.used, key.clone(), entry.value.clone()))
            .collect();
        entries.sort_by_key(|(used, _, _)| *used);
        entries.into_iter().map(|(_, key, value)| (key, value)).collect()
    }
}

impl<K, V> fmt::Display for LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        let accesses = state.hit_count + state.miss_count;
        let hit_percent = if accesses != 0 {
            100 * state.hit_count / accesses
        } else {
            0
        };
        write!(
            f,
            "LruCache[maxSize={},hits={},misses={},hitRate={}%]",
            state.max_size, state.hit_count, state.miss_count, hit_percent
        )
    }
}
