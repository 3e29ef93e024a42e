//! Delay observations and derived percentile buckets.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::window::upstream_minutes;

/// One observed arrival at the route destination.
///
/// Uniquely identified by `(rid, dest)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRecord {
    pub origin: String,
    pub dest: String,
    pub rid: String,
    pub date: NaiveDate,
    /// Scheduled arrival, HHMM.
    pub scheduled_arrival: String,
    /// Actual arrival, HHMM.
    pub actual_arrival: String,
    /// Never negative: early arrivals count as zero.
    pub delay_minutes: u32,
    /// Hour of the scheduled arrival.
    pub hour: u8,
    /// 0 = Monday ... 6 = Sunday.
    pub day_of_week: u8,
}

impl DelayRecord {
    /// Build a record from raw HHMM strings.
    ///
    /// Returns `None` when either time is unparseable; that is absence of
    /// data, not a failure.
    #[must_use]
    pub fn from_times(
        origin: &str,
        dest: &str,
        rid: &str,
        date: NaiveDate,
        scheduled: &str,
        actual: &str,
    ) -> Option<Self> {
        let scheduled_min = upstream_minutes(scheduled)?;
        let actual_min = upstream_minutes(actual)?;
        Some(Self {
            origin: origin.to_string(),
            dest: dest.to_string(),
            rid: rid.to_string(),
            date,
            scheduled_arrival: scheduled.trim()[..4].to_string(),
            actual_arrival: actual.trim()[..4].to_string(),
            delay_minutes: clamped_delay(scheduled_min, actual_min),
            hour: (scheduled_min / 60) as u8,
            day_of_week: date.weekday().num_days_from_monday() as u8,
        })
    }

    /// Deduplication key.
    #[must_use]
    pub fn identity(&self) -> (&str, &str) {
        (&self.rid, &self.dest)
    }
}

/// `actual - scheduled` in minutes, clamped at zero.
#[must_use]
pub fn clamped_delay(scheduled_min: u16, actual_min: u16) -> u32 {
    u32::from(actual_min.saturating_sub(scheduled_min))
}

/// Percentile statistics for one `(origin, dest, hour, day_of_week)` cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileBucket {
    pub origin: String,
    pub dest: String,
    pub hour: u8,
    pub day_of_week: u8,
    pub p80: f64,
    pub p90: f64,
    pub p95: f64,
    pub obs_count: usize,
}

impl PercentileBucket {
    /// `p80 <= p90 <= p95`.
    #[must_use]
    pub fn is_monotone(&self) -> bool {
        self.p80 <= self.p90 && self.p90 <= self.p95
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 27).unwrap()
    }

    #[test]
    fn early_arrival_clamps_to_zero() {
        let record =
            DelayRecord::from_times("PAD", "BRI", "R1", date(), "0905", "0859").unwrap();
        assert_eq!(record.delay_minutes, 0);
        assert_eq!(record.hour, 9);
    }

    #[test]
    fn late_arrival_counts_minutes() {
        let record =
            DelayRecord::from_times("PAD", "BRI", "R1", date(), "0905", "0917").unwrap();
        assert_eq!(record.delay_minutes, 12);
        // 2025-08-27 is a Wednesday.
        assert_eq!(record.day_of_week, 2);
    }

    #[test]
    fn unparseable_times_drop_the_record() {
        assert!(DelayRecord::from_times("PAD", "BRI", "R1", date(), "", "0917").is_none());
        assert!(DelayRecord::from_times("PAD", "BRI", "R1", date(), "0905", "9").is_none());
    }
}
