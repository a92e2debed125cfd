//! The contract of `get_or_insert_with` under forced contention.
//!
//! These tests don't hope for a lucky interleaving. The `race` harness herds all the workers
//! into the creation closure before any of them may leave it, so every run exercises the real
//! thing: N closures running at once, one winner, everyone agreeing on the result.

use std::sync::Arc;

use conmap::race::{run_race, RaceResult};
use conmap::ConMap;

// A few repetitions to also catch the nondeterminism in who wins.
const REPS: usize = 10;

/// Turns the harness' log output on for `RUST_LOG=trace cargo test`.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn check_agreement(result: &RaceResult<u64, u64>, workers: usize) {
    assert_eq!(workers, result.invocations);
    assert_eq!(workers, result.returns.len());
    // Everyone returns the stored entry, by identity, not just by value.
    assert!(result.all_agree());
    // Exactly one worker's candidate won the install.
    assert_eq!(1, result.returns.iter().filter(|r| r.is_new()).count());
}

/// The seed scenario: two workers, key 1, candidates 100 * counter + key.
#[test]
fn two_racers_agree_on_one_value() {
    init_logging();
    for _ in 0..REPS {
        let map = ConMap::new();
        let result = run_race(&map, 1u64, 2, |key, counter| 100 * counter as u64 + key).unwrap();

        check_agreement(&result, 2);
        // The counter reached 2, so the candidates were 101 and 201; either may have won,
        // but both workers got the same one.
        let stored = *result.stored.value();
        assert!(stored == 101 || stored == 201, "Stored {}", stored);
        // And the map still holds the winner afterwards.
        assert!(Arc::ptr_eq(&map.get(&1).unwrap(), &result.stored));
    }
}

/// A single worker has nobody to race with; the closure runs once and its candidate is
/// installed.
#[test]
fn lone_worker_installs_its_candidate() {
    init_logging();
    let map = ConMap::new();
    let result = run_race(&map, 1u64, 1, |key, counter| 100 * counter as u64 + key).unwrap();

    check_agreement(&result, 1);
    assert_eq!(101, *result.stored.value());
    assert_eq!(Some(0), result.winner());
}

/// More than two workers still converge on a single candidate.
#[test]
fn crowd_of_racers_agrees_on_one_value() {
    init_logging();
    const WORKERS: usize = 8;
    for _ in 0..REPS {
        let map = ConMap::new();
        let result =
            run_race(&map, 7u64, WORKERS, |key, counter| 100 * counter as u64 + key).unwrap();

        check_agreement(&result, WORKERS);
        let stored = *result.stored.value();
        assert!(
            (1..=WORKERS as u64).any(|c| stored == 100 * c + 7),
            "Stored {}",
            stored
        );
    }
}

/// Once a race settled a key, later calls return the settled entry without running the
/// closure ever again.
#[test]
fn settled_key_never_reruns_the_closure() {
    init_logging();
    let map = ConMap::new();
    let result = run_race(&map, 1u64, 2, |key, counter| 100 * counter as u64 + key).unwrap();

    let again = map.get_or_insert_with(1, |_| panic!("The key is settled"));
    assert!(!again.is_new());
    assert!(Arc::ptr_eq(&again, &result.stored));
}

/// Races on different keys don't interfere.
#[test]
fn distinct_keys_race_independently() {
    init_logging();
    let map = ConMap::new();
    let first = run_race(&map, 1u64, 2, |key, counter| 100 * counter as u64 + key).unwrap();
    let second = run_race(&map, 2u64, 2, |key, counter| 100 * counter as u64 + key).unwrap();

    check_agreement(&first, 2);
    check_agreement(&second, 2);
    assert!(Arc::ptr_eq(&map.get(&1).unwrap(), &first.stored));
    assert!(Arc::ptr_eq(&map.get(&2).unwrap(), &second.stored));
}

/// Forcing every racer into a single bucket doesn't change the outcome, only the amount of
/// pointer chasing.
#[test]
fn race_in_a_tiny_table() {
    init_logging();
    for _ in 0..REPS {
        let map = ConMap::with_buckets(1);
        // Pre-existing neighbours sharing the bucket with the contested key.
        assert!(map.insert(100u64, 0u64).is_none());
        assert!(map.insert(200, 0).is_none());

        let result = run_race(&map, 1, 4, |key, counter| 100 * counter as u64 + key).unwrap();
        check_agreement(&result, 4);
        // The neighbours survived the race untouched.
        assert_eq!(0, *map.get(&100).unwrap().value());
        assert_eq!(0, *map.get(&200).unwrap().value());
    }
}

/// The plain operations keep their obvious meaning next to all the racing.
#[test]
fn set_get_remove_roundtrip() {
    let map = ConMap::new();
    assert!(map.insert(1u64, 10u64).is_none());
    assert_eq!(10, *map.get(&1).unwrap().value());
    assert_eq!(10, *map.remove(&1).unwrap().value());
    assert!(map.get(&1).is_none());
    assert!(map.remove(&1).is_none());
}

/// Removing a settled key opens a brand new race for it.
#[test]
fn removal_resets_the_race() {
    init_logging();
    let map = ConMap::new();
    let first = run_race(&map, 1u64, 2, |key, counter| 100 * counter as u64 + key).unwrap();
    assert!(map.remove(&1).is_some());

    let second = run_race(&map, 1u64, 2, |key, counter| 100 * counter as u64 + key).unwrap();
    check_agreement(&second, 2);
    assert!(!Arc::ptr_eq(&first.stored, &second.stored));
}
