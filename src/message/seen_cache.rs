//! Bounded duplicate-suppression cache.

use hashlink::LinkedHashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// How a key compares with what the cache already holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// Not seen within the TTL
    First,
    /// Seen before, but now with a higher value
    Improved,
    /// Seen before with an equal or higher value
    Repeat,
}

/// Remembers recently seen keys, bounded by entry count and age.
///
/// Each key can carry a value (for broadcasts, the highest TTL seen).
/// Entries are kept in insertion order so both limits evict from the front.
pub struct SeenCache<K: Hash + Eq, V = ()> {
    entries: LinkedHashMap<K, (Instant, V)>,
    capacity: usize,
    ttl: Duration,
}

impl<K: Hash + Eq> SeenCache<K> {
    /// Record `key`; returns true if it was not seen within the TTL.
    pub fn check_and_insert(&mut self, key: K) -> bool {
        self.observe(key, ()) == Sighting::First
    }
}

impl<K: Hash + Eq, V: Ord> SeenCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LinkedHashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Record `key` with `value`, keeping the highest value seen. An
    /// improvement keeps the entry's original age.
    pub fn observe(&mut self, key: K, value: V) -> Sighting {
        let now = Instant::now();
        self.prune_at(now);

        if let Some((_, best)) = self.entries.get_mut(&key) {
            if value > *best {
                *best = value;
                return Sighting::Improved;
            }
            return Sighting::Repeat;
        }

        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.insert(key, (now, value));
        Sighting::First
    }

    pub fn contains(&self, key: &K) -> bool {
        match self.entries.get(key) {
            Some((seen_at, _)) => seen_at.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Drop entries older than the TTL
    pub fn prune(&mut self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&mut self, now: Instant) {
        while let Some((_, (seen_at, _))) = self.entries.front() {
            if now.duration_since(*seen_at) < self.ttl {
                break;
            }
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_insert_is_duplicate() {
        let mut cache: SeenCache<&str> = SeenCache::new(8, Duration::from_secs(60));
        assert!(cache.check_and_insert("m1"));
        assert!(!cache.check_and_insert("m1"));
        assert!(cache.check_and_insert("m2"));
        assert!(cache.contains(&"m1"));
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut cache: SeenCache<i32> = SeenCache::new(2, Duration::from_secs(60));
        cache.check_and_insert(1);
        cache.check_and_insert(2);
        cache.check_and_insert(3);

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&1));
        assert!(cache.contains(&3));
    }

    #[test]
    fn keeps_highest_value_per_key() {
        let mut cache: SeenCache<&str, u8> = SeenCache::new(8, Duration::from_secs(60));
        assert_eq!(cache.observe("m1", 1), Sighting::First);
        assert_eq!(cache.observe("m1", 1), Sighting::Repeat);
        assert_eq!(cache.observe("m1", 3), Sighting::Improved);
        assert_eq!(cache.observe("m1", 2), Sighting::Repeat);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let mut cache: SeenCache<&str> = SeenCache::new(8, Duration::from_millis(100));
        assert!(cache.check_and_insert("m1"));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!cache.contains(&"m1"));
        assert!(cache.check_and_insert("m1"));
        assert_eq!(cache.len(), 1);
    }
}
