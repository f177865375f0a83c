//! Property tests for cursor compaction. The unit tests in the cursor
//! module pin the documented scenarios; these pin the algebra: whatever the
//! inputs, the cursor never moves backwards, nothing survives below it, and
//! re-running with no new work is a no-op.

use chrono::{DateTime, Duration, Utc};
use courier_core::outbox::{compact, ProcessedSet};
use proptest::prelude::*;

const WINDOW_SECONDS: i64 = 30;

fn window() -> Duration {
    Duration::seconds(WINDOW_SECONDS)
}

fn fixed_now() -> DateTime<Utc> {
    "2026-08-30T12:00:00Z".parse().unwrap()
}

/// (offset above base, age in seconds) pairs for seeding a processed-set
fn arb_entries() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((1..400i64, 0..180i64), 0..24)
}

fn arb_newly() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0..600i64, 0..24)
}

fn seed_set(base: i64, entries: &[(i64, i64)], now: DateTime<Utc>) -> ProcessedSet {
    let mut set = ProcessedSet::new();
    for (offset, age) in entries {
        set.insert(base + offset, now - Duration::seconds(*age));
    }
    set
}

proptest! {
    #[test]
    fn prop_base_never_decreases(
        base in 0..1_000i64,
        entries in arb_entries(),
        newly in arb_newly(),
    ) {
        let now = fixed_now();
        let mut set = seed_set(base, &entries, now);
        let new_base = compact(base, &mut set, &newly, now, window());
        prop_assert!(new_base >= base);
    }

    #[test]
    fn prop_nothing_survives_below_base(
        base in 0..1_000i64,
        entries in arb_entries(),
        newly in arb_newly(),
    ) {
        let now = fixed_now();
        let mut set = seed_set(base, &entries, now);
        let new_base = compact(base, &mut set, &newly, now, window());
        for id in set.ids() {
            prop_assert!(id > new_base, "id {id} survived at or below base {new_base}");
        }
    }

    #[test]
    fn prop_compaction_is_idempotent(
        base in 0..1_000i64,
        entries in arb_entries(),
        newly in arb_newly(),
    ) {
        let now = fixed_now();
        let mut set = seed_set(base, &entries, now);
        let first = compact(base, &mut set, &newly, now, window());
        let snapshot = set.clone();

        let second = compact(first, &mut set, &[], now, window());
        prop_assert_eq!(second, first);
        prop_assert_eq!(set, snapshot);
    }

    #[test]
    fn prop_zero_window_folds_everything(
        base in 0..1_000i64,
        entries in arb_entries(),
        newly in arb_newly(),
    ) {
        let now = fixed_now();
        let mut set = seed_set(base, &entries, now);
        let new_base = compact(base, &mut set, &newly, now, Duration::zero());

        prop_assert!(set.is_empty());
        let expected = entries
            .iter()
            .map(|(offset, _)| base + offset)
            .chain(newly.iter().copied().filter(|&id| id > base))
            .max()
            .unwrap_or(base)
            .max(base);
        prop_assert_eq!(new_base, expected);
    }

    #[test]
    fn prop_fresh_gapped_ids_are_retained(
        base in 0..1_000i64,
        newly in arb_newly(),
    ) {
        // All ids arrive just now: only contiguous folding may advance the
        // base, and every id left behind must still be in the set
        let now = fixed_now();
        let mut set = ProcessedSet::new();
        let new_base = compact(base, &mut set, &newly, now, window());

        let mut above: Vec<i64> = newly.iter().copied().filter(|&id| id > base).collect();
        above.sort_unstable();
        above.dedup();

        // Contiguous prefix folds, the rest is parked
        let mut expected_base = base;
        for &id in &above {
            if id == expected_base + 1 {
                expected_base = id;
            }
        }
        prop_assert_eq!(new_base, expected_base);
        let expected_parked: Vec<i64> =
            above.into_iter().filter(|&id| id > expected_base).collect();
        prop_assert_eq!(set.ids(), expected_parked);
    }

    #[test]
    fn prop_later_now_never_advances_less(
        base in 0..1_000i64,
        entries in arb_entries(),
        delay in 0..600i64,
    ) {
        // Time passing can only make more entries safe
        let now = fixed_now();
        let mut early = seed_set(base, &entries, now);
        let mut late = early.clone();

        let base_early = compact(base, &mut early, &[], now, window());
        let base_late = compact(base, &mut late, &[], now + Duration::seconds(delay), window());
        prop_assert!(base_late >= base_early);
    }
}
