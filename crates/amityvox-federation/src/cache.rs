use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed-capacity keyed cache with per-entry expiry.
///
/// When a `set` would exceed capacity, the entry closest to expiring is
/// evicted. Eviction is by expiry, not recency.
pub struct TtlCache<K, V> {
    inner: Mutex<HashMap<K, Entry<V>>>,
    ttl: Duration,
    capacity: usize,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: K, value: V) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        map.retain(|_, entry| entry.expires_at > now);
        if map.len() >= self.capacity && !map.contains_key(&key) {
            if let Some(nearest) = map
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone())
            {
                map.remove(&nearest);
            }
        }
        map.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
    }

    pub fn invalidate_all(&self) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.clear();
    }

    pub fn len(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_fresh_values() {
        let cache = TtlCache::new(Duration::from_secs(60), 10);
        cache.set("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn expired_entries_are_gone() {
        let cache = TtlCache::new(Duration::from_millis(10), 10);
        cache.set("a", 1);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn overflow_evicts_nearest_to_expire() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.set("oldest", 1);
        std::thread::sleep(Duration::from_millis(5));
        cache.set("newer", 2);
        std::thread::sleep(Duration::from_millis(5));
        cache.set("newest", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"oldest"), None);
        assert_eq!(cache.get(&"newer"), Some(2));
        assert_eq!(cache.get(&"newest"), Some(3));
    }

    #[test]
    fn setting_existing_key_does_not_evict() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(3));
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[test]
    fn invalidate_clears_entries() {
        let cache = TtlCache::new(Duration::from_secs(60), 10);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.invalidate(&"a");
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
