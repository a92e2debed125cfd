//! The core implementation of the concurrent bucket table.
//!
//! This module contains the [`Raw`][crate::raw::Raw] type, the engine below the
//! [`ConMap`][crate::ConMap]. It is exposed to allow wrapping it into further APIs or grouping
//! several operations under a single [`Guard`], but is probably not the best thing for general
//! use.
//!
//! # Internals
//!
//! The table is a fixed-size array of buckets (the size is chosen at construction; growing is
//! out of scope of this crate). Each bucket is an atomic pointer, either null or pointing to an
//! immutable collision list of entries. Readers only ever load a pointer and scan the list.
//! Writers never modify a published list. Every mutation builds a replacement list and installs
//! it with a compare-and-set of the bucket pointer, retrying if some other thread got there
//! first. Replaced lists are handed to the epoch based garbage collector, so readers that still
//! look at them stay safe.
//!
//! This is what produces the advertised behaviour of
//! [`get_or_try_insert_with`][Raw::get_or_try_insert_with]: the creation closure runs between
//! the load and the compare-and-set, with no lock held anywhere. Two threads can therefore both
//! run their closures for the same key at once. The compare-and-set arbitrates ‒ the loser finds
//! the winner's entry on retry, drops its own candidate and returns the winner's.

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use smallvec::SmallVec;

use crate::entry::Entry;
use crate::existing_or_new::ExistingOrNew;

/// How many buckets a table has unless asked otherwise.
///
/// There's no resizing, so this is a compromise between memory used by an almost-empty map and
/// the length of collision lists in a full one. The collision lists keep the table correct at
/// any load factor, just slower.
pub(crate) const DEFAULT_BUCKETS: usize = 64;

// Instead of distinguishing the very common case of single entry and a collision list in our
// code, we just handle everything as a list, possibly with 1 element.
//
// However, as the case with 1 element is much more probable, we don't want the Vec indirection
// there, so we let SmallVec handle it by not spilling in that case.
type Bucket<K, V> = SmallVec<[Arc<Entry<K, V>>; 2]>;

/// What an in-progress insertion carries around between retries.
///
/// The creation closure must run at most once per call even if the compare-and-set below loses
/// several times in a row, so once it produced an entry we keep the entry and reuse it on every
/// retry.
enum InsertState<K, V, F> {
    Empty, // Invalid temporary state.
    Created(Arc<Entry<K, V>>),
    Future { key: K, create: F },
}

impl<K, V, F> InsertState<K, V, F> {
    fn key(&self) -> &K {
        match self {
            InsertState::Empty => unreachable!("Not supposed to live in the empty state"),
            InsertState::Created(entry) => entry.key(),
            InsertState::Future { key, .. } => key,
        }
    }

    /// The candidate entry, created on the first call, reused afterwards.
    ///
    /// If the creation closure fails, the error bubbles up before anything touched the table.
    fn entry<E>(&mut self) -> Result<Arc<Entry<K, V>>, E>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        let entry = match mem::replace(self, InsertState::Empty) {
            InsertState::Empty => unreachable!("Not supposed to live in the empty state"),
            InsertState::Created(entry) => entry,
            InsertState::Future { key, create } => {
                let value = create(&key)?;
                Arc::new(Entry::new(key, value))
            }
        };
        *self = InsertState::Created(Arc::clone(&entry));
        Ok(entry)
    }
}

/// The raw bucket table.
///
/// This provides the low level data structure. It does provide the lock-free operations on the
/// stored entries, but not a user friendly interface: all operations expect the caller to
/// provide a [`crossbeam_epoch`] [`Guard`] and return entries borrowed for as long as both the
/// table and the guard live. Note that even methods that would return owned values in a
/// single-threaded structure (eg. [`insert`][Raw::insert] and [`remove`][Raw::remove]) return
/// borrowed ones here; some other thread might still be accessing them and they are only
/// scheduled for destruction once the epoch ends.
///
/// For the description of the mutation protocol, see the module documentation.
pub struct Raw<K, V, S> {
    hash_builder: S,
    buckets: Box<[Atomic<Bucket<K, V>>]>,
}

impl<K, V, S> Raw<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Constructs an empty table with the default number of buckets.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_buckets_and_hasher(DEFAULT_BUCKETS, hash_builder)
    }

    /// Constructs an empty table with (at least) the requested number of buckets.
    ///
    /// The count is rounded up to the next power of two so a bucket can be picked by masking
    /// the hash.
    pub fn with_buckets_and_hasher(buckets: usize, hash_builder: S) -> Self {
        let cnt = buckets.next_power_of_two().max(1);
        let buckets = (0..cnt)
            .map(|_| Atomic::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            hash_builder,
            buckets,
        }
    }

    /// Computes a hash (using the stored hasher) of a key.
    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn bucket_idx<Q>(&self, key: &Q) -> usize
    where
        Q: ?Sized + Hash,
    {
        // The length is a power of two, so masking picks a valid index.
        self.hash(key) as usize & (self.buckets.len() - 1)
    }

    fn bucket<Q>(&self, key: &Q) -> &Atomic<Bucket<K, V>>
    where
        Q: ?Sized + Hash,
    {
        &self.buckets[self.bucket_idx(key)]
    }

    /// Looks up an entry.
    pub fn get<'r, 's, 'p, Q>(&'s self, key: &Q, pin: &'p Guard) -> Option<&'r Arc<Entry<K, V>>>
    where
        's: 'r,
        'p: 'r,
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let node = self.bucket(key).load(Ordering::Acquire, pin);
        unsafe { node.as_ref() }?
            .iter()
            .find(|e| e.key().borrow() == key)
    }

    /// Inserts a new entry, replacing and returning any previously held one.
    pub fn insert<'s, 'p, 'r>(
        &'s self,
        entry: Arc<Entry<K, V>>,
        pin: &'p Guard,
    ) -> Option<&'r Arc<Entry<K, V>>>
    where
        's: 'r,
        'p: 'r,
    {
        let slot = self.bucket(entry.key());
        loop {
            let node = slot.load(Ordering::Acquire, pin);
            let current = unsafe { node.as_ref() };
            let old = current.and_then(|b| b.iter().find(|e| e.key() == entry.key()));
            let mut new = Bucket::<K, V>::with_capacity(current.map_or(0, |b| b.len()) + 1);
            new.extend(
                current
                    .into_iter()
                    .flatten()
                    .filter(|e| e.key() != entry.key())
                    .cloned(),
            );
            new.push(Arc::clone(&entry));
            // If we fail to set it, the new bucket is dropped together with the Err case,
            // freeing the entry clones inside, and we retry on the fresh value.
            match slot.compare_and_set_weak(node, Owned::new(new), Ordering::Release, pin) {
                Ok(_) => {
                    if !node.is_null() {
                        unsafe { pin.defer_destroy(node) };
                    }
                    return old;
                }
                Err(_) => (),
            }
        }
    }

    /// Looks up an entry or creates (and inserts) a new one from the provided closure.
    ///
    /// The closure runs without any lock held; see the module documentation for what that means
    /// when several threads call this with the same absent key. If the closure fails, the error
    /// is passed on and the table is left untouched ‒ unless some other thread succeeded with
    /// its own closure in the meantime, the key stays absent.
    pub fn get_or_try_insert_with<'s, 'p, 'r, F, E>(
        &'s self,
        key: K,
        create: F,
        pin: &'p Guard,
    ) -> Result<ExistingOrNew<&'r Arc<Entry<K, V>>>, E>
    where
        's: 'r,
        'p: 'r,
        F: FnOnce(&K) -> Result<V, E>,
    {
        let slot = self.bucket(&key);
        let mut state = InsertState::Future { key, create };
        loop {
            let node = slot.load(Ordering::Acquire, pin);
            let current = unsafe { node.as_ref() };
            if let Some(existing) = current.and_then(|b| b.iter().find(|e| e.key() == state.key()))
            {
                // Someone stored the key before us ‒ possibly between our failed compare-and-set
                // and this load. Whatever candidate we may have computed is dropped with the
                // state and the caller gets the winner's entry.
                return Ok(ExistingOrNew::Existing(existing));
            }

            // The key is absent right now, so produce the candidate. Any other thread may be
            // doing exactly the same for the same key at this moment; the compare-and-set below
            // decides whose candidate gets stored.
            let candidate = state.entry()?;
            let mut new = Bucket::<K, V>::with_capacity(current.map_or(0, |b| b.len()) + 1);
            new.extend(current.into_iter().flatten().cloned());
            new.push(candidate);
            match slot.compare_and_set_weak(node, Owned::new(new), Ordering::Release, pin) {
                Ok(installed) => {
                    if !node.is_null() {
                        unsafe { pin.defer_destroy(node) };
                    }
                    let installed = unsafe { installed.deref() };
                    let entry = installed.last().expect("Just pushed the candidate in");
                    return Ok(ExistingOrNew::New(entry));
                }
                // Retry. The failed bucket is dropped with the Err case; the candidate stays
                // memoized in the state, so the closure won't run again.
                Err(_) => (),
            }
        }
    }

    /// Removes an entry identified by the key, returning it if it was found.
    ///
    /// A bucket emptied by the removal is set back to null, so
    /// [`is_empty`][Raw::is_empty] stays truthful.
    pub fn remove<'r, 's, 'p, Q>(&'s self, key: &Q, pin: &'p Guard) -> Option<&'r Arc<Entry<K, V>>>
    where
        's: 'r,
        'p: 'r,
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let slot = self.bucket(key);
        loop {
            let node = slot.load(Ordering::Acquire, pin);
            let current = unsafe { node.as_ref() }?;
            let removed = current.iter().find(|e| e.key().borrow() == key)?;
            let new = current
                .iter()
                .filter(|e| e.key().borrow() != key)
                .cloned()
                .collect::<Bucket<K, V>>();
            let new = if new.is_empty() {
                Shared::null()
            } else {
                Owned::new(new).into_shared(pin)
            };
            match slot.compare_and_set_weak(node, new, Ordering::Release, pin) {
                Ok(_) => {
                    unsafe { pin.defer_destroy(node) };
                    return Some(removed);
                }
                Err(e) => {
                    if !e.new.is_null() {
                        unsafe { drop(e.new.into_owned()) };
                    }
                }
            }
        }
    }

    /// Checks for emptiness.
    pub fn is_empty(&self) -> bool {
        // This relies on removal nulling emptied buckets.
        // We can use the unprotected guard here, because we are not actually interested in what
        // the pointers point to, only whether they are null. Therefore we can also use the
        // Relaxed ordering.
        unsafe {
            let pin = crossbeam_epoch::unprotected();
            self.buckets
                .iter()
                .all(|bucket| bucket.load(Ordering::Relaxed, pin).is_null())
        }
    }

    // Hack: &mut to make sure it is not shared between threads and nobody is modifying the
    // thing right now.
    /// Panics if the table violates its structural invariants.
    #[cfg(test)]
    pub(crate) fn assert_clean(&mut self) {
        // Unprotected and Relaxed are fine, we are &mut so nobody else is allowed to do stuff
        // to us at the moment.
        let pin = unsafe { crossbeam_epoch::unprotected() };
        for (idx, bucket) in self.buckets.iter().enumerate() {
            let node = bucket.load(Ordering::Relaxed, pin);
            if let Some(data) = unsafe { node.as_ref() } {
                assert!(!data.is_empty(), "Empty buckets must be null");
                for (i, entry) in data.iter().enumerate() {
                    assert_eq!(
                        idx,
                        self.bucket_idx(entry.key()),
                        "Entry stored in a wrong bucket"
                    );
                    assert!(
                        data.iter().take(i).all(|other| other.key() != entry.key()),
                        "Duplicate key within a bucket"
                    );
                }
            }
        }
    }
}

impl<K, V, S> Drop for Raw<K, V, S> {
    fn drop(&mut self) {
        /*
         * Notes about unsafety here:
         * * We are in a destructor and that one is &mut self. There are no concurrent accesses
         *   to this data structure any more, therefore we can safely assume we are the only
         *   ones looking at the pointers inside.
         * * Therefore, using unprotected is also fine.
         * * Similarly, the Relaxed ordering here is fine too, as the whole data structure must
         *   have been synchronized into our thread already by this time.
         * * The pointers inside this data structure are never dangling.
         */
        unsafe {
            let pin = crossbeam_epoch::unprotected();
            for bucket in self.buckets.iter() {
                let node = bucket.load(Ordering::Relaxed, pin);
                if !node.is_null() {
                    drop(node.into_owned());
                }
            }
        }
    }
}
