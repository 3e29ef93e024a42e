//! Time-of-day windows in HHMM form.
//!
//! A window is an inclusive range of minutes since midnight: `0600-0659`
//! covers sixty minutes. Bisection splits at `(start + end) / 2` into
//! `[start, mid]` and `[mid + 1, end]`, which is the half-open split
//! `[start, mid + 1)` / `[mid + 1, end + 1)` written in HHMM.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Last minute of the day (`2359`).
pub const LAST_MINUTE: u16 = 24 * 60 - 1;

/// Parse an `HHMM` string into minutes since midnight.
///
/// Accepts exactly four ASCII digits with `HH < 24` and `MM < 60`.
pub fn parse_hhmm(raw: &str) -> Result<u16, ConfigError> {
    let raw = raw.trim();
    if raw.len() != 4 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ConfigError::ValidationError(format!(
            "time `{raw}` must be 4 digits (HHMM)"
        )));
    }
    let hours: u16 = raw[..2].parse().unwrap_or(u16::MAX);
    let minutes: u16 = raw[2..].parse().unwrap_or(u16::MAX);
    if hours >= 24 || minutes >= 60 {
        return Err(ConfigError::ValidationError(format!(
            "time `{raw}` contains an invalid hour or minute"
        )));
    }
    Ok(hours * 60 + minutes)
}

/// Lenient HHMM parse used on upstream payloads: trailing characters are
/// ignored, anything shorter than four characters, non-numeric or out of
/// range yields `None`.
#[must_use]
pub fn upstream_minutes(raw: &str) -> Option<u16> {
    let raw = raw.trim();
    if raw.len() < 4 || !raw.is_char_boundary(4) {
        return None;
    }
    let hours: u16 = raw[..2].parse().ok()?;
    let minutes: u16 = raw[2..4].parse().ok()?;
    (hours < 24 && minutes < 60).then_some(hours * 60 + minutes)
}

/// Format minutes since midnight as `HHMM`.
#[must_use]
pub fn format_hhmm(minutes: u16) -> String {
    format!("{:02}{:02}", minutes / 60, minutes % 60)
}

/// An inclusive time-of-day window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeWindow {
    start: u16,
    end: u16,
}

impl TimeWindow {
    /// Build a window from minutes since midnight.
    pub fn new(start: u16, end: u16) -> Result<Self, ConfigError> {
        if end > LAST_MINUTE {
            return Err(ConfigError::ValidationError(format!(
                "window end {end} is past 2359"
            )));
        }
        if start > end {
            return Err(ConfigError::ValidationError(format!(
                "window {}-{} starts after it ends",
                format_hhmm(start),
                format_hhmm(end)
            )));
        }
        Ok(Self { start, end })
    }

    /// Build a window from two `HHMM` strings.
    pub fn parse(from: &str, to: &str) -> Result<Self, ConfigError> {
        Self::new(parse_hhmm(from)?, parse_hhmm(to)?)
    }

    #[must_use]
    pub fn start_minute(&self) -> u16 {
        self.start
    }

    #[must_use]
    pub fn end_minute(&self) -> u16 {
        self.end
    }

    #[must_use]
    pub fn from_hhmm(&self) -> String {
        format_hhmm(self.start)
    }

    #[must_use]
    pub fn to_hhmm(&self) -> String {
        format_hhmm(self.end)
    }

    /// Number of minutes covered, counting both ends.
    #[must_use]
    pub fn span_minutes(&self) -> u16 {
        self.end - self.start + 1
    }

    /// Whether both halves of a split would still span `min_minutes`.
    #[must_use]
    pub fn can_bisect(&self, min_minutes: u16) -> bool {
        self.span_minutes() / 2 >= min_minutes.max(1)
    }

    /// Split at the midpoint. Returns `None` for single-minute windows.
    #[must_use]
    pub fn bisect(&self) -> Option<(Self, Self)> {
        if self.start == self.end {
            return None;
        }
        let mid = (self.start + self.end) / 2;
        Some((
            Self {
                start: self.start,
                end: mid,
            },
            Self {
                start: mid + 1,
                end: self.end,
            },
        ))
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from_hhmm(), self.to_hhmm())
    }
}

impl FromStr for TimeWindow {
    type Err = ConfigError;

    /// Accepts `HHMM-HHMM` or `HHMM,HHMM`. Short values are zero-padded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s
            .split_once(['-', ','])
            .ok_or_else(|| ConfigError::ValidationError(format!("window `{s}` must be HHMM,HHMM")))?;
        let pad = |v: &str| format!("{:0>4}", v.trim());
        Self::parse(&pad(from), &pad(to))
    }
}

impl Serialize for TimeWindow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.from_hhmm(), self.to_hhmm()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TimeWindow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (from, to) = <(String, String)>::deserialize(deserializer)?;
        Self::parse(&from, &to).map_err(serde::de::Error::custom)
    }
}
