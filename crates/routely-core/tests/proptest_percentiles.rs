//! Property-based tests for percentile aggregation.
//!
//! Covers interpolation bounds, bucket monotonicity, one bucket per cell and
//! observation-count conservation.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use proptest::prelude::*;

use routely_core::aggregate::{compute_buckets, percentile};
use routely_core::record::DelayRecord;

// =============================================================================
// Strategies
// =============================================================================

fn arb_delays() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec((0u32..600).prop_map(f64::from), 1..200)
}

fn arb_hhmm() -> impl Strategy<Value = String> {
    (0u16..24, 0u16..60).prop_map(|(h, m)| format!("{h:02}{m:02}"))
}

/// Records over a handful of routes, days and hours.
fn arb_records() -> impl Strategy<Value = Vec<DelayRecord>> {
    prop::collection::vec(
        (
            prop::sample::select(vec![("PAD", "BRI"), ("VIC", "GTW"), ("KGX", "EDB")]),
            0u32..14,
            arb_hhmm(),
            0u16..180,
            "[A-Z0-9]{6}",
        ),
        0..300,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .filter_map(|((origin, dest), day, scheduled, late, rid)| {
                let date = NaiveDate::from_ymd_opt(2025, 8, 1)?
                    .checked_add_days(chrono::Days::new(u64::from(day)))?;
                let minutes = scheduled[..2].parse::<u16>().ok()? * 60
                    + scheduled[2..].parse::<u16>().ok()?;
                let actual = (minutes + late).min(23 * 60 + 59);
                let actual = format!("{:02}{:02}", actual / 60, actual % 60);
                DelayRecord::from_times(origin, dest, &rid, date, &scheduled, &actual)
            })
            .collect()
    })
}

// =============================================================================
// Percentile function
// =============================================================================

proptest! {
    #[test]
    fn percentile_within_min_and_max(mut delays in arb_delays(), p in 0.0f64..=100.0) {
        delays.sort_by(f64::total_cmp);
        let value = percentile(&delays, p).unwrap();
        prop_assert!(value >= delays[0] - 1e-9);
        prop_assert!(value <= delays[delays.len() - 1] + 1e-9);
    }

    #[test]
    fn percentile_is_monotone_in_p(mut delays in arb_delays(), a in 0.0f64..=100.0, b in 0.0f64..=100.0) {
        delays.sort_by(f64::total_cmp);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(percentile(&delays, lo).unwrap() <= percentile(&delays, hi).unwrap() + 1e-9);
    }

    #[test]
    fn constant_series_has_constant_percentiles(value in 0u32..500, n in 1usize..50) {
        let delays = vec![f64::from(value); n];
        for p in [80.0, 90.0, 95.0] {
            prop_assert_eq!(percentile(&delays, p), Some(f64::from(value)));
        }
    }
}

// =============================================================================
// Buckets
// =============================================================================

proptest! {
    #[test]
    fn buckets_are_monotone_and_non_negative(records in arb_records()) {
        for bucket in compute_buckets(&records) {
            prop_assert!(bucket.obs_count > 0);
            prop_assert!(bucket.p80 >= 0.0);
            prop_assert!(bucket.p80 <= bucket.p90, "{:?}", bucket);
            prop_assert!(bucket.p90 <= bucket.p95, "{:?}", bucket);
        }
    }

    #[test]
    fn one_bucket_per_cell(records in arb_records()) {
        let buckets = compute_buckets(&records);
        let cells: BTreeSet<_> = records
            .iter()
            .map(|r| (r.origin.clone(), r.dest.clone(), r.hour, r.day_of_week))
            .collect();
        prop_assert_eq!(buckets.len(), cells.len());
        let obs: usize = buckets.iter().map(|b| b.obs_count).sum();
        prop_assert_eq!(obs, records.len());
    }
}

#[test]
fn documented_interpolation_example() {
    let p90 = percentile(&[2.0, 5.0, 9.0, 20.0], 90.0).unwrap();
    assert!((p90 - 16.7).abs() < 1e-9);
}
