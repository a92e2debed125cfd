//! The [`Entry`][crate::Entry] type.

use std::ops::Deref;

/// A single key/value pair stored in the map.
///
/// An entry is immutable once constructed and is handed out from the map as
/// `Arc<Entry<K, V>>`. Because of that, the identity of a stored value is the identity of its
/// `Arc` ‒ two racing inserts of equal values still produce distinguishable entries, and
/// [`Arc::ptr_eq`][std::sync::Arc::ptr_eq] tells which one actually won.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Entry<K, V> {
    data: (K, V),
}

impl<K, V> Entry<K, V> {
    /// Creates a new entry out of the key and value.
    pub fn new(key: K, value: V) -> Self {
        Self { data: (key, value) }
    }

    /// The key part.
    pub fn key(&self) -> &K {
        &self.data.0
    }

    /// The value part.
    pub fn value(&self) -> &V {
        &self.data.1
    }
}

impl<K, V> Deref for Entry<K, V> {
    type Target = (K, V);
    fn deref(&self) -> &(K, V) {
        &self.data
    }
}
