//! The [`ConMap`][crate::ConMap] type and its helpers.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::convert::Infallible;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use crate::entry::Entry;
use crate::existing_or_new::ExistingOrNew;
use crate::raw::Raw;

/// A concurrent map with a get-or-insert operation that lets insertions race.
///
/// The map is lock-free and can be accessed from any number of threads at once. Entries are
/// stored behind [`Arc`]s, so looking up returns a cheap handle instead of cloning the data.
///
/// The interesting operation is [`get_or_insert_with`][ConMap::get_or_insert_with]. Its
/// contract under contention is deliberately loose on one side and strict on the other:
///
/// * The creation closure may run once in *each* thread racing for the same absent key. It is
///   invoked with no lock held, so nothing serializes the computations.
/// * Exactly one of the computed candidates is ever stored. Every racing call returns that one
///   stored entry (the same `Arc`, not an equal copy), and exactly one call observes
///   [`ExistingOrNew::New`].
///
/// Side effects of the closures whose candidates lost are *not* rolled back. If that matters,
/// the closure should not have any.
///
/// # Examples
///
/// ```rust
/// use conmap::ConMap;
/// use crossbeam_utils::thread;
///
/// let map = ConMap::new();
///
/// thread::scope(|s| {
///     for _ in 0..2 {
///         s.spawn(|_| {
///             map.get_or_insert_with(42, |key| key + 1);
///         });
///     }
/// })
/// .unwrap();
///
/// assert_eq!(43, *map.get(&42).unwrap().value());
/// ```
pub struct ConMap<K, V, S = RandomState> {
    raw: Raw<K, V, S>,
}

impl<K, V> ConMap<K, V>
where
    K: Hash + Eq,
{
    /// Creates a new empty map with the default hasher and bucket count.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }

    /// Creates a new empty map with (at least) the given number of buckets.
    ///
    /// The map never grows, so the bucket count is a throughput knob, not a capacity limit;
    /// everything still works (just slower) when the collision lists get long.
    pub fn with_buckets(buckets: usize) -> Self {
        Self {
            raw: Raw::with_buckets_and_hasher(buckets, RandomState::default()),
        }
    }
}

impl<K, V, S> ConMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates a new empty map with the given hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            raw: Raw::with_hasher(hasher),
        }
    }

    /// Inserts a new value, replacing and returning any previous one (last writer wins).
    pub fn insert(&self, key: K, value: V) -> Option<Arc<Entry<K, V>>> {
        self.insert_entry(Arc::new(Entry::new(key, value)))
    }

    /// Inserts a pre-built entry, replacing and returning any previous one for the same key.
    pub fn insert_entry(&self, entry: Arc<Entry<K, V>>) -> Option<Arc<Entry<K, V>>> {
        let pin = crossbeam_epoch::pin();
        self.raw.insert(entry, &pin).map(Arc::clone)
    }

    /// Looks up an entry.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.get(key, &pin).map(Arc::clone)
    }

    /// Looks up the entry for the key, or computes and inserts one if it is absent.
    ///
    /// If the key is present, the closure is not invoked at all and the stored entry is
    /// returned. If it is absent, the closure runs (with no lock held) and the map attempts to
    /// install the computed value. Several threads may reach that point with the same key at
    /// once; each runs its own closure, but only one candidate is installed and every caller
    /// returns that one entry. See the [type documentation][ConMap] for the full contract.
    pub fn get_or_insert_with<F>(&self, key: K, create: F) -> ExistingOrNew<Arc<Entry<K, V>>>
    where
        F: FnOnce(&K) -> V,
    {
        let result = self.get_or_try_insert_with(key, |key| Ok::<_, Infallible>(create(key)));
        match result {
            Ok(entry) => entry,
            Err(infallible) => match infallible {},
        }
    }

    /// The fallible flavour of [`get_or_insert_with`][ConMap::get_or_insert_with].
    ///
    /// If the closure fails, the error is propagated to this (and only this) caller and nothing
    /// is stored. Other threads racing for the same key are unaffected ‒ each runs its own
    /// closure and succeeds or fails on its own.
    pub fn get_or_try_insert_with<F, E>(
        &self,
        key: K,
        create: F,
    ) -> Result<ExistingOrNew<Arc<Entry<K, V>>>, E>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw
            .get_or_try_insert_with(key, create, &pin)
            .map(|entry| entry.map(Arc::clone))
    }

    /// Looks up the entry for the key, or inserts the provided value if it is absent.
    pub fn get_or_insert(&self, key: K, value: V) -> ExistingOrNew<Arc<Entry<K, V>>> {
        self.get_or_insert_with(key, |_| value)
    }

    /// Looks up the entry for the key, or inserts a default value if it is absent.
    pub fn get_or_insert_default(&self, key: K) -> ExistingOrNew<Arc<Entry<K, V>>>
    where
        V: Default,
    {
        self.get_or_insert_with(key, |_| V::default())
    }

    /// Removes an entry, returning it if the key was present.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.remove(key, &pin).map(Arc::clone)
    }

    /// Checks if the map contains no entries.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl<K, V> Default for ConMap<K, V>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}
