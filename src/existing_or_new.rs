//! The [`ExistingOrNew`][crate::ExistingOrNew] enum.

use std::ops::{Deref, DerefMut};

/// Distinguishes whether an operation found an already existing value or installed a new one.
///
/// This is what [`get_or_insert_with`][crate::ConMap::get_or_insert_with] returns. When several
/// threads race to fill the same absent key, exactly one of them gets the [`New`][ExistingOrNew::New]
/// variant (its candidate is the one that got stored) and all the others get
/// [`Existing`][ExistingOrNew::Existing] wrapping that same stored value.
///
/// It dereferences to the held value, so in most code it can be used as if it was the value
/// itself. The distinction can be queried with [`is_new`][ExistingOrNew::is_new] or dropped
/// altogether with [`into_inner`][ExistingOrNew::into_inner].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ExistingOrNew<T> {
    /// The value was already present and is returned unchanged.
    Existing(T),
    /// The value was created by this very call and installed into the map.
    New(T),
}

impl<T> ExistingOrNew<T> {
    /// Extracts the inner value.
    pub fn into_inner(self) -> T {
        match self {
            ExistingOrNew::Existing(value) => value,
            ExistingOrNew::New(value) => value,
        }
    }

    /// Applies a transformation to the value.
    ///
    /// The information whether the value was existing or newly created is preserved.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ExistingOrNew<U> {
        match self {
            ExistingOrNew::Existing(value) => ExistingOrNew::Existing(f(value)),
            ExistingOrNew::New(value) => ExistingOrNew::New(f(value)),
        }
    }

    /// Checks if the value was created by this call.
    pub fn is_new(&self) -> bool {
        match self {
            ExistingOrNew::New(_) => true,
            ExistingOrNew::Existing(_) => false,
        }
    }
}

impl<T> Deref for ExistingOrNew<T> {
    type Target = T;
    fn deref(&self) -> &T {
        match self {
            ExistingOrNew::Existing(value) => value,
            ExistingOrNew::New(value) => value,
        }
    }
}

impl<T> DerefMut for ExistingOrNew<T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            ExistingOrNew::Existing(value) => value,
            ExistingOrNew::New(value) => value,
        }
    }
}
