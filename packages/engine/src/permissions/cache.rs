use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Process-wide key/value cache with per-entry expiry. Constructed once and handed to the
/// permission evaluator explicitly.
pub trait Cache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    fn put(&self, key: K, value: V, ttl: Duration);

    fn invalidate(&self, key: &K);

    /// Keeps only the entries whose key passes `keep`.
    fn retain(&self, keep: &dyn Fn(&K) -> bool);
}

pub struct MemoryCache<K, V> {
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K, V> MemoryCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, (V, Instant)>> {
        // a panic while holding the lock leaves the map itself consistent
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K, V> Default for MemoryCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Cache<K, V> for MemoryCache<K, V>
where
    K: Eq + Hash + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Also drops every expired entry, so scopes that are never released age out.
    fn put(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key, (value, now + ttl));
    }

    fn invalidate(&self, key: &K) {
        self.entries().remove(key);
    }

    fn retain(&self, keep: &dyn Fn(&K) -> bool) {
        let now = Instant::now();
        self.entries()
            .retain(|key, (_, expires_at)| *expires_at > now && keep(key));
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, MemoryCache};
    use std::time::Duration;

    #[test]
    fn returns_live_entries() {
        let cache = MemoryCache::new();
        cache.put("a", 1, Duration::from_secs(60));
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn expired_entries_miss_and_are_dropped() {
        let cache = MemoryCache::new();
        cache.put("a", 1, Duration::ZERO);
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn put_sweeps_expired_entries() {
        let cache = MemoryCache::new();
        for key in ["a", "b", "c"] {
            cache.put(key, 0, Duration::ZERO);
        }
        cache.put("d", 1, Duration::from_secs(60));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"d"), Some(1));
    }

    #[test]
    fn invalidate_and_retain_remove_entries() {
        let cache = MemoryCache::new();
        for key in ["a", "b", "c"] {
            cache.put(key, key.len(), Duration::from_secs(60));
        }
        cache.invalidate(&"a");
        cache.retain(&|key: &&str| *key != "b");
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"c"), Some(1));
        assert_eq!(cache.len(), 1);
    }
}
