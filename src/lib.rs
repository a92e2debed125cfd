#![doc(html_root_url = "https://docs.rs/conmap/0.1.0")]
#![deny(missing_docs)]

//! A concurrent map that lets insertions race, and a harness to prove they do.
//!
//! The [`ConMap`] is an ordinary looking concurrent key/value map (lookup, insert, remove),
//! with one operation worth the trouble: [`get_or_insert_with`][ConMap::get_or_insert_with].
//! It returns the stored value for the key or, if the key is absent, computes one with a
//! caller-supplied closure and installs it. The fine print is its behaviour under contention:
//!
//! * The closure runs with **no lock held**. When several threads ask for the same absent key
//!   at once, each of them may run its own closure. The map does not serialize the
//!   computations, only the final install step.
//! * Exactly one of the computed candidates is stored. Every racing caller gets that one value
//!   back (the same `Arc`, not a lookalike) and exactly one caller is told (through
//!   [`ExistingOrNew`]) that its candidate won.
//! * Nobody ever sees a half-inserted value; the install is a single atomic pointer swap.
//!
//! This is the same bargain `ConcurrentDictionary.GetOrAdd` or similar structures strike: pay
//! for possible duplicated computation, never block, agree on the result. The losing
//! candidates are simply dropped; their side effects (if the closure had any) are *not* rolled
//! back.
//!
//! Because "may run the closure twice" is exactly the kind of claim that hides in a
//! nanosecond-wide scheduling window, the crate also ships the [`race`] module, a harness
//! that stages the race deterministically: it herds N real OS threads into the closure at the
//! same time, holds them there until all have arrived, then lets them fight over the install
//! and reports who computed what and who won. The tests of this crate use it to pin the
//! contract down; it is public so tests of code built on top can do the same.
//!
//! # Examples
//!
//! ```rust
//! use conmap::ConMap;
//!
//! let map = ConMap::new();
//! let val = map.get_or_insert_with("answer", |_| 42);
//! assert!(val.is_new());
//! assert_eq!(42, *map.get("answer").unwrap().value());
//! ```
//!
//! Staging an actual two-thread race:
//!
//! ```rust
//! use conmap::race::run_race;
//! use conmap::ConMap;
//!
//! let map = ConMap::new();
//! let result = run_race(&map, 1u64, 2, |key, counter| 100 * counter as u64 + key).unwrap();
//!
//! // Both closures ran...
//! assert_eq!(2, result.invocations);
//! // ...but only one candidate was stored and everyone agrees which one.
//! let stored = *result.stored.value();
//! assert!(stored == 101 || stored == 201);
//! assert!(result.all_agree());
//! ```
//!
//! # Lifetimes of the values
//!
//! The map hands out entries as `Arc<Entry<K, V>>`. Removing or overwriting an entry does not
//! invalidate handles somebody else still holds; the entry's memory is reclaimed only after
//! the last handle is gone (and, internally, after all concurrent readers have moved on ‒ the
//! map uses epoch based reclamation from [`crossbeam_epoch`]).

pub mod entry;
pub mod existing_or_new;
pub mod map;
pub mod race;
pub mod raw;

pub use crate::entry::Entry;
pub use crate::existing_or_new::ExistingOrNew;
pub use crate::map::ConMap;
