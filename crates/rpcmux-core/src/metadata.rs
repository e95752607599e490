//! Initial and trailing metadata.

use bytes::Bytes;

/// Ordered multimap of metadata entries.
///
/// Keys are stored lower-cased. Duplicate keys are kept in insertion
/// order, which is the order they go out on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataMap {
    entries: Vec<(String, Bytes)>,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; existing values for `key` are kept.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<Bytes>) {
        self.entries
            .push((key.as_ref().to_ascii_lowercase(), value.into()));
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        let key = key.to_ascii_lowercase();
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// First value for `key` as UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Every value for `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a Bytes> + 'a {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Remove every value for `key`; returns how many were removed.
    pub fn remove(&mut self, key: &str) -> usize {
        let key = key.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != key);
        before - self.entries.len()
    }

    /// Move every entry of `other` to the end of `self`.
    pub fn extend(&mut self, other: MetadataMap) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: AsRef<str>, V: Into<Bytes>> FromIterator<(K, V)> for MetadataMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = MetadataMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multimap_order_and_case() {
        let mut md = MetadataMap::new();
        md.insert("X-Trace", "a");
        md.insert("x-trace", "b");
        md.insert("other", "c");

        assert_eq!(md.len(), 3);
        assert_eq!(md.get_str("X-TRACE"), Some("a"));
        let all: Vec<_> = md.get_all("x-trace").cloned().collect();
        assert_eq!(all, vec![Bytes::from("a"), Bytes::from("b")]);

        assert_eq!(md.remove("x-trace"), 2);
        assert_eq!(md.len(), 1);
        assert!(md.get("x-trace").is_none());
    }

    #[test]
    fn test_from_iter_and_extend() {
        let mut a: MetadataMap = [("k1", "v1")].into_iter().collect();
        let b: MetadataMap = [("k2", "v2"), ("k1", "v3")].into_iter().collect();
        a.extend(b);
        let keys: Vec<_> = a.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, ["k1", "k2", "k1"]);
    }
}
