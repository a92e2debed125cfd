//! A deterministic driver for racing [`get_or_insert_with`][crate::ConMap::get_or_insert_with]
//! calls.
//!
//! The interesting part of the map's contract only shows when several threads reach the
//! creation closure for the same key *at the same time*. Left to the scheduler, that window is
//! a handful of instructions wide and a test hitting it is a matter of luck. This module forces
//! the interleaving instead of hoping for it.
//!
//! [`run_race`] starts one OS thread per requested worker, each calling
//! `get_or_insert_with` on the same key. The closure handed to the map is wrapped so that every
//! worker entering it first reports in to the coordinator and then blocks on a gate. The
//! coordinator opens the gate only after *all* workers have reported in. At that point every
//! worker provably sits inside its own closure invocation, so the race is real, not incidental.
//! Only then are the workers released to compute their candidates and fight over the install.
//!
//! The workers must be genuine OS threads. A cooperative (async or green-thread) scheduler
//! multiplexing one core could hide the race by construction, which would make the whole
//! exercise pointless; this module therefore spawns real threads and nothing else.
//!
//! # Examples
//!
//! ```rust
//! use conmap::race::run_race;
//! use conmap::ConMap;
//!
//! let map = ConMap::new();
//! let result = run_race(&map, 1u64, 2, |key, counter| 100 * counter as u64 + key).unwrap();
//!
//! // Both closures ran, but only one candidate got stored and both workers got that one.
//! assert_eq!(2, result.invocations);
//! assert!(result.all_agree());
//! ```

use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_utils::thread;
use log::{debug, trace};
use thiserror::Error;

use crate::entry::Entry;
use crate::existing_or_new::ExistingOrNew;
use crate::map::ConMap;

/// How long [`run_race`] waits for all the workers to reach their closures.
///
/// Generous on purpose. It only ever matters on a loaded CI machine or when the harness is
/// misused (see [`HarnessError::Stalled`]), and a spurious stall report is worse than a slow
/// test.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);

/// A failure of the harness machinery itself.
///
/// These mean the race could not be staged, not that the map broke its contract.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum HarnessError {
    /// Some workers never reached the creation closure within the time bound.
    ///
    /// Apart from extreme scheduling delays, the usual cause is racing on a key that is
    /// already present: such workers return right away without ever entering the closure, so
    /// they have nothing to report in from.
    #[error("workers {missing:?} did not reach the creation closure in time")]
    Stalled {
        /// Indexes of the workers that never checked in.
        missing: Vec<usize>,
    },
    /// A worker thread panicked (eg. a panicking creation closure).
    #[error("worker {worker} panicked while racing")]
    Panicked {
        /// Index of the first worker found panicked.
        worker: usize,
    },
}

/// What a successfully staged race produced.
///
/// The assertions themselves are left to the caller; this only gathers the observations.
#[derive(Debug)]
pub struct RaceResult<K, V> {
    /// How many times the creation closure actually ran.
    ///
    /// With all workers forced into the closure concurrently this equals the worker count,
    /// because the map does not serialize the closures, only the install step.
    pub invocations: usize,
    /// The entry stored under the contested key after every worker finished.
    pub stored: Arc<Entry<K, V>>,
    /// What each worker's call returned, in worker order.
    ///
    /// Exactly one of these is [`ExistingOrNew::New`], the worker whose candidate won the
    /// install.
    pub returns: Vec<ExistingOrNew<Arc<Entry<K, V>>>>,
}

impl<K, V> RaceResult<K, V> {
    /// Checks that every worker returned the stored entry (the same `Arc`, not a copy).
    pub fn all_agree(&self) -> bool {
        self.returns
            .iter()
            .all(|ret| Arc::ptr_eq(ret, &self.stored))
    }

    /// Index of the worker whose candidate got installed, if any.
    pub fn winner(&self) -> Option<usize> {
        self.returns.iter().position(|ret| ret.is_new())
    }
}

/// A one-shot gate the workers block on until the coordinator opens it.
struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Self {
        Gate {
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut open = self.open.lock().expect("Gate lock poisoned");
        while !*open {
            open = self.cond.wait(open).expect("Gate lock poisoned");
        }
    }

    fn open(&self) {
        *self.open.lock().expect("Gate lock poisoned") = true;
        self.cond.notify_all();
    }
}

/// Runs a staged race with the [default timeout][DEFAULT_START_TIMEOUT].
///
/// See [`run_race_with_timeout`] for the details.
pub fn run_race<K, V, S, F>(
    map: &ConMap<K, V, S>,
    key: K,
    workers: usize,
    create: F,
) -> Result<RaceResult<K, V>, HarnessError>
where
    K: Clone + Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
    F: Fn(&K, usize) -> V + Sync,
{
    run_race_with_timeout(map, key, workers, create, DEFAULT_START_TIMEOUT)
}

/// Forces `workers` concurrent `get_or_insert_with` calls on the same key and reports what
/// happened.
///
/// Every worker runs on its own OS thread and calls the map with a wrapped closure which:
///
/// 1. atomically takes the next invocation ordinal (1-based),
/// 2. reports in to the coordinator,
/// 3. blocks until the coordinator has seen *all* workers report in,
/// 4. computes the candidate as `create(&key, ordinal)`.
///
/// The ordinal makes each worker's candidate distinguishable, so the caller can tell whose
/// candidate got stored.
///
/// The key should be absent and `workers` at least 1; racing on a present key means no worker
/// ever reaches the closure and the run ends with [`HarnessError::Stalled`]. The per-worker
/// wait for check-ins is bounded by `start_timeout`, so a stall is reported instead of hanging
/// the test. On a stall the gate is opened anyway, which lets the workers that did arrive
/// finish and the run still joins every thread before returning.
///
/// # Panics
///
/// If `workers` is zero. There would be nobody to produce a stored value.
pub fn run_race_with_timeout<K, V, S, F>(
    map: &ConMap<K, V, S>,
    key: K,
    workers: usize,
    create: F,
    start_timeout: Duration,
) -> Result<RaceResult<K, V>, HarnessError>
where
    K: Clone + Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
    F: Fn(&K, usize) -> V + Sync,
{
    assert!(workers > 0, "A race needs at least one worker");

    let invocations = AtomicUsize::new(0);
    let gate = Gate::new();
    let (started, checkins) = mpsc::channel();

    let outcome = thread::scope(|s| {
        let handles = (0..workers)
            .map(|worker| {
                let started = started.clone();
                let key = key.clone();
                let invocations = &invocations;
                let gate = &gate;
                let create = &create;
                s.spawn(move |_| {
                    map.get_or_insert_with(key, |key| {
                        let ordinal = invocations.fetch_add(1, Ordering::SeqCst) + 1;
                        trace!("Worker {} entered the closure as invocation {}", worker, ordinal);
                        started
                            .send(worker)
                            .expect("Coordinator outlives the workers");
                        gate.wait();
                        create(key, ordinal)
                    })
                })
            })
            .collect::<Vec<_>>();

        // The rendezvous: every worker must be inside its closure before any of them may leave
        // it. Each check-in waits at most start_timeout, so a lost worker turns into an error,
        // not a hung test.
        let mut checked_in = vec![false; workers];
        let mut missing = workers;
        while missing > 0 {
            match checkins.recv_timeout(start_timeout) {
                Ok(worker) => {
                    if !checked_in[worker] {
                        checked_in[worker] = true;
                        missing -= 1;
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let stalled = checked_in
            .iter()
            .enumerate()
            .filter(|&(_, checked)| !checked)
            .map(|(worker, _)| worker)
            .collect::<Vec<_>>();

        if stalled.is_empty() {
            trace!("All {} workers inside their closures, releasing", workers);
        } else {
            debug!("Workers {:?} never reached the closure", stalled);
        }
        // Open the gate even on a stall, so the workers that did arrive can finish and the
        // joins below terminate.
        gate.open();

        let mut returns = Vec::with_capacity(workers);
        let mut panicked = None;
        for (worker, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(ret) => returns.push(ret),
                Err(_) => {
                    panicked.get_or_insert(worker);
                }
            }
        }

        if let Some(worker) = panicked {
            return Err(HarnessError::Panicked { worker });
        }
        if !stalled.is_empty() {
            return Err(HarnessError::Stalled { missing: stalled });
        }

        let stored = map
            .get(&key)
            .expect("All workers finished, yet nothing is stored under the contested key");
        Ok(RaceResult {
            invocations: invocations.load(Ordering::SeqCst),
            stored,
            returns,
        })
    });
    outcome.expect("All worker panics are consumed by joining")
}
