//! Thread-safe LRU with an entry limit and a byte budget
//!
//! Recency is tracked by the `lru` crate; this wrapper adds byte accounting
//! and evicts least-recently-used entries until both limits hold.

use ::lru::LruCache as RecencyList;
use parking_lot::Mutex;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// A thread-safe LRU cache bounded by entry count and total bytes.
pub struct LruCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K: Hash + Eq, V> {
    entries: RecencyList<K, (V, usize)>,
    total_bytes: usize,
    max_bytes: usize,
}

impl<K: Clone + Hash + Eq, V: Clone> LruCache<K, V> {
    /// Create a cache holding at most `max_entries` items and `max_bytes` bytes
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: RecencyList::new(capacity),
                total_bytes: 0,
                max_bytes,
            }),
        }
    }

    /// Get a value, marking it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.entries.get(key).map(|(value, _)| value.clone())
    }

    /// Whether `key` is present, without touching recency
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Insert a value, returning the keys evicted to make room.
    /// A replaced value for the same key is not reported as evicted.
    pub fn insert(&self, key: K, value: V, byte_size: usize) -> Vec<K> {
        let mut inner = self.inner.lock();
        let mut evicted = Vec::new();

        inner.total_bytes = inner.total_bytes.saturating_add(byte_size);
        if let Some((old_key, (_, old_bytes))) = inner.entries.push(key.clone(), (value, byte_size)) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old_bytes);
            if old_key != key {
                evicted.push(old_key);
            }
        }

        while inner.total_bytes > inner.max_bytes {
            match inner.entries.pop_lru() {
                Some((old_key, (_, old_bytes))) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(old_bytes);
                    evicted.push(old_key);
                }
                None => break,
            }
        }

        evicted
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let (value, bytes) = inner.entries.pop(key)?;
        inner.total_bytes = inner.total_bytes.saturating_sub(bytes);
        Some(value)
    }

    /// Remove every entry whose key matches `predicate`, returning how many went
    pub fn remove_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let mut inner = self.inner.lock();
        let doomed: Vec<K> = inner
            .entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            if let Some((_, bytes)) = inner.entries.pop(key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(bytes);
            }
        }
        doomed.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.inner.lock().max_bytes
    }

    pub fn max_entries(&self) -> usize {
        self.inner.lock().entries.cap().get()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }
}

impl<K: Hash + Eq, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LruCache")
            .field("len", &inner.entries.len())
            .field("total_bytes", &inner.total_bytes)
            .field("max_bytes", &inner.max_bytes)
            .finish()
    }
}
