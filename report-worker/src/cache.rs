use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;

/// Fixed-capacity LRU map shared by the pipeline workers.
///
/// Every operation takes the same lock, so concurrent callers are serialized
/// and never observe a half-applied update.
pub struct ResolutionCache<K, V> {
    name: &'static str,
    entries: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V: Clone> ResolutionCache<K, V> {
    /// A zero capacity is bumped to one.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns a copy of the value and marks the key most recently used.
    pub async fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Inserts or replaces the value, evicting the least recently used key if full.
    pub async fn put(&self, key: K, value: V) {
        self.entries.lock().await.put(key, value);
    }

    /// Like `put` for a whole set of keys, under a single lock acquisition.
    pub async fn put_all(&self, items: impl IntoIterator<Item = (K, V)>) {
        let mut entries = self.entries.lock().await;
        for (key, value) in items {
            entries.put(key, value);
        }
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.entries.lock().await.contains(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn capacity(&self) -> usize {
        self.entries.lock().await.cap().get()
    }
}
