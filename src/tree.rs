//! Indexed Tree
//!
//! Ordered, range-queryable map shared by the partition router (range map),
//! the inode table and the dentry table.
//!
//! Records live behind `Arc` and the map itself is reference counted, so
//! `clone()` is a pointer copy. The first mutation after a clone copies the
//! node structure (record pointers only, never the records), which leaves
//! every outstanding clone exactly as it was when it was taken.

use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::Arc;

/// Ordered map with O(1) snapshot clones
#[derive(Debug, PartialEq, Eq)]
pub struct IndexedTree<K, V> {
    root: Arc<BTreeMap<K, Arc<V>>>,
}

impl<K, V> Clone for IndexedTree<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: Arc::clone(&self.root),
        }
    }
}

impl<K, V> Default for IndexedTree<K, V> {
    fn default() -> Self {
        Self {
            root: Arc::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord + Clone, V> IndexedTree<K, V> {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.root.len()
    }

    /// Check if the tree holds no records
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Look up a record by key
    pub fn get(&self, key: &K) -> Option<&V> {
        self.root.get(key).map(|v| v.as_ref())
    }

    /// Check if a key is present
    pub fn contains_key(&self, key: &K) -> bool {
        self.root.contains_key(key)
    }

    /// Insert or replace a record, returning the previous one
    pub fn insert(&mut self, key: K, value: V) -> Option<Arc<V>> {
        Arc::make_mut(&mut self.root).insert(key, Arc::new(value))
    }

    /// Remove a record, returning it
    pub fn remove(&mut self, key: &K) -> Option<Arc<V>> {
        if !self.root.contains_key(key) {
            return None;
        }
        Arc::make_mut(&mut self.root).remove(key)
    }

    /// Largest key less than or equal to `key`
    pub fn descend_le(&self, key: &K) -> Option<(&K, &V)> {
        self.root
            .range(..=key.clone())
            .next_back()
            .map(|(k, v)| (k, v.as_ref()))
    }

    /// Ascending traversal over every record
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.root.iter().map(|(k, v)| (k, v.as_ref()))
    }

    /// Ascending traversal over the records
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.root.values().map(|v| v.as_ref())
    }

    /// Ascending traversal over a key range
    pub fn range<R: RangeBounds<K>>(&self, range: R) -> impl Iterator<Item = (&K, &V)> {
        self.root.range(range).map(|(k, v)| (k, v.as_ref()))
    }

    /// Consume the tree into its records, in key order
    pub fn into_records(self) -> impl Iterator<Item = (K, Arc<V>)> {
        Arc::try_unwrap(self.root)
            .unwrap_or_else(|shared| (*shared).clone())
            .into_iter()
    }

    /// Check if both trees still share the same underlying structure
    pub fn shares_root(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }
}

impl<K: Ord + Clone, V: Clone> IndexedTree<K, V> {
    /// Mutate a record in place; returns `None` if the key is absent
    pub fn update<F, T>(&mut self, key: &K, f: F) -> Option<T>
    where
        F: FnOnce(&mut V) -> T,
    {
        if !self.root.contains_key(key) {
            return None;
        }
        let record = Arc::make_mut(&mut self.root).get_mut(key)?;
        Some(f(Arc::make_mut(record)))
    }
}

impl<K: Ord + Clone, V> FromIterator<(K, V)> for IndexedTree<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = iter.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();
        Self {
            root: Arc::new(map),
        }
    }
}
