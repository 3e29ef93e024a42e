//! Ingestion tasks and their lifecycle status.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StorageError};
use crate::window::TimeWindow;

/// An origin/destination location-code pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct Route {
    pub origin: String,
    pub dest: String,
}

impl Route {
    #[must_use]
    pub fn new(origin: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            origin: origin.into().trim().to_uppercase(),
            dest: dest.into().trim().to_uppercase(),
        }
    }
}

impl From<(String, String)> for Route {
    fn from((origin, dest): (String, String)) -> Self {
        Self::new(origin, dest)
    }
}

impl From<Route> for (String, String) {
    fn from(route: Route) -> Self {
        (route.origin, route.dest)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.origin, self.dest)
    }
}

impl FromStr for Route {
    type Err = ConfigError;

    /// Parses `ORIGIN,DEST`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(str::trim);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(origin), Some(dest), None) if !origin.is_empty() && !dest.is_empty() => {
                Ok(Self::new(origin, dest))
            }
            _ => Err(ConfigError::ValidationError(format!(
                "route `{s}` must be ORIGIN,DEST"
            ))),
        }
    }
}

/// Upstream day-type filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaysTag {
    Weekday,
    Saturday,
    Sunday,
}

impl DaysTag {
    #[must_use]
    pub fn for_date(date: NaiveDate) -> Self {
        match date.weekday() {
            Weekday::Sat => Self::Saturday,
            Weekday::Sun => Self::Sunday,
            _ => Self::Weekday,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weekday => "WEEKDAY",
            Self::Saturday => "SATURDAY",
            Self::Sunday => "SUNDAY",
        }
    }
}

/// One independent unit of ingestion: a route on a date within a window.
///
/// Tasks are immutable; bisection creates children with narrower windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub date: NaiveDate,
    pub route: Route,
    pub window: TimeWindow,
    /// Bisection generation: 0 for planned tasks, parent + 1 for children.
    #[serde(default)]
    pub depth: u32,
}

impl Task {
    #[must_use]
    pub fn new(date: NaiveDate, route: Route, window: TimeWindow) -> Self {
        Self {
            date,
            route,
            window,
            depth: 0,
        }
    }

    /// Deterministic composite key: `date_origin_dest_from_to`.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.date.format("%Y-%m-%d"),
            self.route.origin,
            self.route.dest,
            self.window.from_hhmm(),
            self.window.to_hhmm()
        )
    }

    #[must_use]
    pub fn days_tag(&self) -> DaysTag {
        DaysTag::for_date(self.date)
    }

    /// Child tasks covering the two halves of this task's window.
    #[must_use]
    pub fn bisect(&self) -> Option<(Self, Self)> {
        let (first, second) = self.window.bisect()?;
        let child = |window| Self {
            date: self.date,
            route: self.route.clone(),
            window,
            depth: self.depth + 1,
        };
        Some((child(first), child(second)))
    }
}

/// Lifecycle status of a task, as persisted in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ok,
    Failed,
    Timeout,
    CircuitBreaker,
    Bisected,
    Skipped,
}

impl TaskStatus {
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Ok,
        Self::Failed,
        Self::Timeout,
        Self::CircuitBreaker,
        Self::Bisected,
        Self::Skipped,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::CircuitBreaker => "circuit_breaker",
            Self::Bisected => "bisected",
            Self::Skipped => "skipped",
        }
    }

    /// Completed work that a resumed run must not execute again.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Ok | Self::Skipped | Self::Bisected)
    }

    /// Statuses cleared by a selective reset and eligible for retry passes.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout | Self::CircuitBreaker)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StorageError::UnknownStatus(s.to_string()))
    }
}
