//! Stream id → stream table for one connection.
//!
//! Stream ids are assigned in increasing order on a connection, so the
//! table is two parallel vectors kept sorted by construction and searched
//! with binary search. Deleting an entry leaves a tombstone in place; the
//! vectors are compacted lazily, when an insert finds them full and more
//! than a quarter of the slots are tombstones.
//!
//! ```text
//! keys:   [ 1 | 3 | 5 | 7 | 9 ]
//! values: [ A | - | C | - | E ]      free = 2, len() = 3
//! ```
//!
//! The table is not internally synchronized. A connection keeps it under
//! its own lock; lookups must hold that lock too because an insert may be
//! reallocating the vectors.

use rand::Rng;

/// Initial capacity for `StreamMap::new`.
pub const DEFAULT_CAPACITY: usize = 8;

/// Capacity multiplier applied when the table is full and mostly live.
pub const GROWTH_FACTOR: usize = 2;

/// Sorted, compactable map from stream id to stream handle.
#[derive(Debug)]
pub struct StreamMap<V> {
    keys: Vec<u32>,
    /// `None` marks a tombstone.
    values: Vec<Option<V>>,
    /// Number of tombstones in `values`.
    free: usize,
    /// Logical capacity; always > 1.
    capacity: usize,
    /// Most recently inserted key, remembered across compaction and reset.
    last_key: Option<u32>,
}

impl<V> StreamMap<V> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Table with room for `capacity` entries (at least 2).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            keys: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            free: 0,
            capacity,
            last_key: None,
        }
    }

    /// Insert `value` under `key`.
    ///
    /// # Panics
    ///
    /// If `key` is not strictly greater than every key inserted before.
    /// Stream ids only move forward on a connection; anything else is a
    /// protocol violation upstream.
    pub fn add(&mut self, key: u32, value: V) {
        if let Some(last) = self.last_key {
            assert!(
                key > last,
                "stream id {key} is not above the last inserted id {last}"
            );
        }

        if self.keys.len() == self.capacity {
            if self.free > self.capacity / 4 {
                self.compact();
            } else {
                self.grow();
            }
        }

        self.keys.push(key);
        self.values.push(Some(value));
        self.last_key = Some(key);
    }

    /// Live value for `key`.
    pub fn find(&self, key: u32) -> Option<&V> {
        let idx = self.index_of(key)?;
        self.values[idx].as_ref()
    }

    pub fn find_mut(&mut self, key: u32) -> Option<&mut V> {
        let idx = self.index_of(key)?;
        self.values[idx].as_mut()
    }

    /// Tombstone `key` and return its value. Deleting a missing or already
    /// deleted key is a no-op returning `None`.
    pub fn delete(&mut self, key: u32) -> Option<V> {
        let idx = self.index_of(key)?;
        let value = self.values[idx].take()?;
        self.free += 1;

        // Fully drained: drop the tombstones now instead of compacting later.
        if self.free == self.keys.len() {
            self.keys.clear();
            self.values.clear();
            self.free = 0;
        }
        Some(value)
    }

    /// Visit every live entry in increasing key order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(u32, &V),
    {
        for (key, value) in self.iter() {
            f(key, value);
        }
    }

    /// Live entries in increasing key order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &V)> + '_ {
        self.keys
            .iter()
            .zip(self.values.iter())
            .filter_map(|(k, v)| v.as_ref().map(|v| (*k, v)))
    }

    /// Live ids in increasing order.
    pub fn keys(&self) -> Vec<u32> {
        self.iter().map(|(k, _)| k).collect()
    }

    /// Uniformly random live entry, compacting first if there are
    /// tombstones.
    pub fn random_pick(&mut self) -> Option<(u32, &V)> {
        self.random_pick_with(&mut rand::thread_rng())
    }

    pub fn random_pick_with<R>(&mut self, rng: &mut R) -> Option<(u32, &V)>
    where
        R: Rng + ?Sized,
    {
        if self.len() == 0 {
            return None;
        }
        if self.free != 0 {
            self.compact();
        }
        let idx = rng.gen_range(0..self.keys.len());
        self.values[idx].as_ref().map(|v| (self.keys[idx], v))
    }

    /// Number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len() - self.free
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deleted slots not yet reclaimed.
    #[inline]
    pub fn tombstones(&self) -> usize {
        self.free
    }

    fn index_of(&self, key: u32) -> Option<usize> {
        // Tombstones keep their key, so the key vector stays sorted.
        self.keys.binary_search(&key).ok()
    }

    /// Slide live entries left over the tombstones, preserving order.
    fn compact(&mut self) {
        let mut out = 0;
        for i in 0..self.keys.len() {
            if self.values[i].is_some() {
                self.keys[out] = self.keys[i];
                self.values.swap(out, i);
                out += 1;
            }
        }
        self.keys.truncate(out);
        self.values.truncate(out);
        self.free = 0;
    }

    fn grow(&mut self) {
        self.capacity *= GROWTH_FACTOR;
        let extra = self.capacity - self.keys.len();
        self.keys.reserve_exact(extra);
        self.values.reserve_exact(extra);
    }
}

impl<V> Default for StreamMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_basic_add_find_delete() {
        let mut map = StreamMap::new();
        map.add(1, "A");
        map.add(2, "B");
        assert_eq!(map.find(2), Some(&"B"));
        assert_eq!(map.delete(1), Some("A"));
        assert_eq!(map.find(1), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut map = StreamMap::new();
        map.add(1, 10);
        map.add(3, 30);
        assert_eq!(map.delete(1), Some(10));
        assert_eq!(map.delete(1), None);
        assert_eq!(map.delete(99), None);
        assert_eq!(map.len(), 1);
        assert_eq!(map.tombstones(), 1);
    }

    #[test]
    fn test_full_drain_resets() {
        let mut map = StreamMap::new();
        for id in [1, 3, 5] {
            map.add(id, id);
        }
        for id in [3, 1, 5] {
            map.delete(id);
        }
        assert!(map.is_empty());
        assert_eq!(map.tombstones(), 0);
        // Monotonicity still applies after the reset.
        map.add(7, 7);
        assert_eq!(map.find(7), Some(&7));
    }

    #[test]
    #[should_panic(expected = "not above the last inserted id")]
    fn test_non_monotonic_add_panics() {
        let mut map = StreamMap::new();
        map.add(5, ());
        map.add(3, ());
    }

    #[test]
    #[should_panic(expected = "not above the last inserted id")]
    fn test_reused_id_after_delete_panics() {
        let mut map = StreamMap::new();
        map.add(1, ());
        map.add(3, ());
        map.delete(3);
        map.add(3, ());
    }

    #[test]
    fn test_growth_is_minimal() {
        let mut map = StreamMap::with_capacity(4);
        for id in 1..=9 {
            map.add(id, id);
        }
        // 4 -> 8 -> 16 is the smallest doubling that holds 9 entries.
        assert_eq!(map.capacity(), 16);
    }

    #[test]
    fn test_compaction_keeps_live_entries() {
        let mut map = StreamMap::with_capacity(8);
        for id in 1..=8u32 {
            map.add(id, id * 100);
        }
        for id in 1..=6 {
            map.delete(id);
        }
        assert_eq!(map.tombstones(), 6);

        map.add(9, 900);

        assert_eq!(map.capacity(), 8, "compaction should avoid growing");
        assert_eq!(map.tombstones(), 0);
        assert_eq!(map.find(7), Some(&700));
        assert_eq!(map.find(8), Some(&800));
        assert_eq!(map.find(9), Some(&900));
        assert_eq!(map.find(3), None);
        assert_eq!(map.keys(), vec![7, 8, 9]);
    }

    #[test]
    fn test_full_but_mostly_live_grows() {
        let mut map = StreamMap::with_capacity(8);
        for id in 1..=8 {
            map.add(id, ());
        }
        map.delete(4);
        map.delete(6);
        // 2 tombstones of 8 is not more than a quarter.
        map.add(9, ());
        assert_eq!(map.capacity(), 16);
        assert_eq!(map.tombstones(), 2);
    }

    #[test]
    fn test_tiny_capacity_clamped() {
        let mut map = StreamMap::with_capacity(0);
        assert_eq!(map.capacity(), 2);
        map.add(1, 'a');
        map.add(2, 'b');
        map.add(3, 'c');
        assert_eq!(map.capacity(), 4);
    }

    #[test]
    fn test_for_each_visits_live_in_order() {
        let mut map = StreamMap::new();
        for id in (1..20).step_by(2) {
            map.add(id, id);
        }
        map.delete(5);
        map.delete(11);

        let mut seen = Vec::new();
        map.for_each(|k, v| {
            assert_eq!(k, *v);
            seen.push(k);
        });
        assert_eq!(seen, vec![1, 3, 7, 9, 13, 15, 17, 19]);
    }

    #[test]
    fn test_random_pick_compacts_and_returns_live() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut map = StreamMap::new();
        for id in 1..=6 {
            map.add(id, id);
        }
        map.delete(2);
        map.delete(4);

        for _ in 0..50 {
            let (k, v) = map.random_pick_with(&mut rng).unwrap();
            assert_eq!(k, *v);
            assert!(k != 2 && k != 4);
        }
        assert_eq!(map.tombstones(), 0);

        let mut empty: StreamMap<u32> = StreamMap::new();
        assert!(empty.random_pick().is_none());
    }

    #[test]
    fn test_random_pick_reaches_every_entry() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut map = StreamMap::new();
        for id in 1..=4 {
            map.add(id, ());
        }
        let mut hits = [0usize; 5];
        for _ in 0..400 {
            let (k, _) = map.random_pick_with(&mut rng).unwrap();
            hits[k as usize] += 1;
        }
        assert!(hits[1..].iter().all(|&h| h > 50), "skewed pick: {hits:?}");
    }
}
