//! Sorted keyed map on a contiguous array of pairs.

use std::borrow::Borrow;
use std::fmt;

/// A map stored as a `Vec` of key/value pairs sorted by key.
///
/// Keys are unique; lookups are binary searches. Indices returned by the
/// bound queries are positions into the sorted storage and are invalidated
/// by `insert` and `remove`.
#[derive(Clone)]
pub struct FlatMap<K, V> {
    entries: Vec<(K, V)>,
}

impl<K, V> Default for FlatMap<K, V> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<K: Ord, V> FlatMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity) }
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

    fn search<Q>(&self, key: &Q) -> Result<usize, usize>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.entries.binary_search_by(|(k, _)| k.borrow().cmp(key))
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.search(key).is_ok()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.search(key).ok().map(|i| &self.entries[i].1)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match self.search(key) {
            Ok(i) => Some(&mut self.entries[i].1),
            Err(_) => None,
        }
    }

    /// Inserts `value` under `key`, preserving key uniqueness.
    ///
    /// Returns the previously mapped value when the key was present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        match self.search(&key) {
            Ok(i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            Err(i) => {
                self.entries.insert(i, (key, value));
                None
            }
        }
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match self.search(key) {
            Ok(i) => Some(self.entries.remove(i).1),
            Err(_) => None,
        }
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        self.entries.first().map(|(k, v)| (k, v))
    }

    pub fn last(&self) -> Option<(&K, &V)> {
        self.entries.last().map(|(k, v)| (k, v))
    }

    /// Index of the first entry whose key is `>= key`.
    pub fn lower_bound<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match self.search(key) {
            Ok(i) | Err(i) => i,
        }
    }

    /// Index of the first entry whose key is `> key`.
    pub fn upper_bound<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match self.search(key) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Half-open index range of entries equal to `key` (at most one).
    pub fn equal_range<Q>(&self, key: &Q) -> (usize, usize)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        (self.lower_bound(key), self.upper_bound(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.iter_mut().map(|(_, v)| v)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&K, &mut V) -> bool) {
        self.entries.retain_mut(|(k, v)| keep(k, v));
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for FlatMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<K, V> IntoIterator for FlatMap<K, V> {
    type Item = (K, V);
    type IntoIter = std::vec::IntoIter<(K, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for FlatMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter().map(|(k, v)| (k, v))).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_keys_unique_and_sorted() {
        let mut map = FlatMap::new();
        for key in [5u32, 1, 3, 2, 4, 3] {
            map.insert(key, key * 10);
        }
        assert_eq!(map.len(), 5);
        let keys: Vec<u32> = map.keys().copied().collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn insert_replaces_and_returns_previous() {
        let mut map = FlatMap::new();
        assert_eq!(map.insert("a", 1), None);
        assert_eq!(map.insert("a", 2), Some(1));
        assert_eq!(map.get("a"), Some(&2));
    }

    #[test]
    fn remove_and_lookup() {
        let mut map: FlatMap<u32, &str> = [(1, "one"), (2, "two"), (3, "three")]
            .into_iter()
            .collect();
        assert_eq!(map.remove(&2), Some("two"));
        assert_eq!(map.remove(&2), None);
        assert_eq!(map.get(&1), Some(&"one"));
        assert_eq!(map.get(&2), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn bounds_agree_with_reference_sorted_array() {
        let map: FlatMap<u32, ()> = [2u32, 4, 6, 8].into_iter().map(|k| (k, ())).collect();
        // Keys present.
        assert_eq!(map.lower_bound(&4), 1);
        assert_eq!(map.upper_bound(&4), 2);
        assert_eq!(map.equal_range(&4), (1, 2));
        // Keys absent: lower == upper.
        assert_eq!(map.lower_bound(&5), 2);
        assert_eq!(map.upper_bound(&5), 2);
        assert_eq!(map.equal_range(&5), (2, 2));
        // Below and above every key.
        assert_eq!(map.lower_bound(&0), 0);
        assert_eq!(map.upper_bound(&9), 4);
    }

    #[test]
    fn retain_removes_matching_entries() {
        let mut map: FlatMap<u32, u32> = (0..10u32).map(|k| (k, k)).collect();
        map.retain(|k, _| k % 2 == 0);
        let keys: Vec<u32> = map.keys().copied().collect();
        assert_eq!(keys, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn first_and_last_follow_key_order() {
        let map: FlatMap<u32, &str> = [(7, "seven"), (3, "three")].into_iter().collect();
        assert_eq!(map.first(), Some((&3, &"three")));
        assert_eq!(map.last(), Some((&7, &"seven")));
    }
}
