//! Concurrent key/value map
//!
//! Shared map safe for many readers and writers, with the
//! put-if-absent primitive the audit cache relies on to elect a
//! single EXPLAIN owner per statement.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

/// A key→value map guarded by a reader/writer lock.
///
/// Values are cloned out on access; callers that need sharing store
/// `Arc`s. `range` iterates over a consistent snapshot: every entry
/// present at the start of the call and not removed concurrently is
/// visited exactly once.
pub struct SyncMap<K, V> {
    kvs: RwLock<HashMap<K, V>>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self { kvs: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.kvs.read().unwrap().get(key).cloned()
    }

    /// Inserts the value, overriding any existing entry.
    pub fn put(&self, key: K, value: V) {
        self.kvs.write().unwrap().insert(key, value);
    }

    /// Inserts the value only if the key is absent.
    ///
    /// Returns the value now stored under the key and whether it was
    /// already present (`loaded == true` means another caller won).
    pub fn put_if_absent(&self, key: K, value: V) -> (V, bool) {
        let mut kvs = self.kvs.write().unwrap();
        match kvs.get(&key) {
            Some(existing) => (existing.clone(), true),
            None => {
                kvs.insert(key, value.clone());
                (value, false)
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.kvs.write().unwrap().remove(key)
    }

    /// Visits entries until `f` returns false.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let kvs = self.kvs.read().unwrap();
        for (k, v) in kvs.iter() {
            if !f(k, v) {
                return;
            }
        }
    }

    /// Clones the full contents.
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.kvs.read().unwrap().clone()
    }

    pub fn clear(&self) {
        self.kvs.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.kvs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.kvs.read().unwrap().is_empty()
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn put_if_absent_selects_one_winner() {
        let map = Arc::new(SyncMap::<String, usize>::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let map = Arc::clone(&map);
            handles.push(thread::spawn(move || {
                let (_, loaded) = map.put_if_absent("q".to_string(), i);
                loaded
            }));
        }
        let losers = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|loaded| *loaded)
            .count();
        assert_eq!(losers, 15);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn range_stops_when_asked() {
        let map = SyncMap::new();
        for i in 0..10 {
            map.put(i, i * 2);
        }
        let mut seen = 0;
        map.range(|_, _| {
            seen += 1;
            seen < 3
        });
        assert_eq!(seen, 3);
    }

    #[test]
    fn remove_returns_previous_value() {
        let map = SyncMap::new();
        map.put("k", 1);
        assert_eq!(map.remove(&"k"), Some(1));
        assert_eq!(map.remove(&"k"), None);
    }
}
