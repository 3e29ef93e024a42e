//! Property-based tests for identifier and record deduplication.
//!
//! Ingesting the same responses twice must give the same deduplicated
//! record set, and identifier selection must be stable for a task key.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use proptest::prelude::*;

use routely_core::aggregate::dedup_records;
use routely_core::api::RidRef;
use routely_core::record::DelayRecord;
use routely_core::sampling::select_rids;

// =============================================================================
// Strategies
// =============================================================================

fn arb_rid_refs() -> impl Strategy<Value = Vec<RidRef>> {
    prop::collection::vec(
        ("R[0-9]{1,3}", prop::option::of(0u8..24)).prop_map(|(rid, hour)| RidRef { rid, hour }),
        0..400,
    )
}

fn arb_records() -> impl Strategy<Value = Vec<DelayRecord>> {
    prop::collection::vec(
        (
            "R[0-9]{1,2}",
            prop::sample::select(vec!["BRI", "SWI"]),
            0u16..60,
        ),
        0..200,
    )
    .prop_map(|rows| {
        let date = NaiveDate::from_ymd_opt(2025, 8, 27).unwrap();
        rows.into_iter()
            .filter_map(|(rid, dest, late)| {
                DelayRecord::from_times("PAD", dest, &rid, date, "0900", &format!("09{late:02}"))
            })
            .collect()
    })
}

fn identities(records: &[DelayRecord]) -> BTreeSet<(String, String)> {
    records
        .iter()
        .map(|r| (r.rid.clone(), r.dest.clone()))
        .collect()
}

// =============================================================================
// Record dedup
// =============================================================================

proptest! {
    #[test]
    fn dedup_is_idempotent(records in arb_records()) {
        let once = dedup_records(records);
        let twice = dedup_records(once.clone());
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn ingesting_twice_changes_nothing(records in arb_records()) {
        let once = dedup_records(records.clone());
        let mut doubled = records.clone();
        doubled.extend(records);
        let again = dedup_records(doubled);
        prop_assert_eq!(identities(&once), identities(&again));
        prop_assert_eq!(once.len(), again.len());
    }

    #[test]
    fn dedup_keeps_every_identity_once(records in arb_records()) {
        let expected = identities(&records);
        let out = dedup_records(records);
        prop_assert_eq!(out.len(), expected.len());
        prop_assert_eq!(identities(&out), expected);
    }
}

// =============================================================================
// Identifier selection
// =============================================================================

proptest! {
    #[test]
    fn selection_is_deterministic(refs in arb_rid_refs(), cap in 0usize..40) {
        let a = select_rids(refs.clone(), cap, "2025-08-27_PAD_BRI_0600_0859");
        let b = select_rids(refs, cap, "2025-08-27_PAD_BRI_0600_0859");
        prop_assert_eq!(a, b);
    }

    #[test]
    fn selection_has_no_duplicates_and_respects_cap(refs in arb_rid_refs(), cap in 1usize..40) {
        let selection = select_rids(refs, cap, "k");
        let unique: BTreeSet<&str> = selection.rids.iter().map(|r| r.rid.as_str()).collect();
        prop_assert_eq!(unique.len(), selection.rids.len());
        prop_assert!(selection.after_cap() <= selection.after_dedup);
        prop_assert!(selection.after_dedup <= selection.before_dedup);

        let mut per_hour = std::collections::BTreeMap::new();
        for r in &selection.rids {
            *per_hour.entry(r.hour).or_insert(0usize) += 1;
        }
        prop_assert!(per_hour.values().all(|&n| n <= cap));
    }

    #[test]
    fn duplicated_input_selects_the_same(refs in arb_rid_refs(), cap in 0usize..40) {
        let mut doubled = refs.clone();
        doubled.extend(refs.clone());
        prop_assert_eq!(select_rids(refs, cap, "k").rids, select_rids(doubled, cap, "k").rids);
    }
}
