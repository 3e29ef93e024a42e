//! Data-quality gate over the percentile table.
//!
//! A run fails QA when the dataset is empty, when a configured route collected
//! nothing, when more than half of the expected `(origin, dest, hour,
//! day_of_week)` cells are sparse, or when any bucket breaks
//! `0 <= p80 <= p90 <= p95`.
//!
//! The expected cells are every configured route crossed with the hours its
//! time windows touch and the weekdays of the date range. Cells with no
//! observations count as sparse.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::record::PercentileBucket;
use crate::slice_writer::SliceLog;
use crate::task::TaskStatus;

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QaVerdict {
    Pass,
    Fail,
}

impl QaVerdict {
    #[must_use]
    pub fn passed(self) -> bool {
        self == Self::Pass
    }
}

impl fmt::Display for QaVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        })
    }
}

/// Observation count of one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageCell {
    pub route: String,
    pub hour: u8,
    pub day_of_week: u8,
    pub obs_count: usize,
    pub sparse: bool,
}

/// Cells a run is expected to fill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageGrid {
    routes: BTreeSet<String>,
    hours: BTreeSet<u8>,
    days: BTreeSet<u8>,
}

impl CoverageGrid {
    #[must_use]
    pub fn new(
        routes: impl IntoIterator<Item = String>,
        hours: impl IntoIterator<Item = u8>,
        days: impl IntoIterator<Item = u8>,
    ) -> Self {
        Self {
            routes: routes.into_iter().collect(),
            hours: hours.into_iter().collect(),
            days: days.into_iter().collect(),
        }
    }

    /// Configured routes x hours touched by `time_windows` x weekdays between
    /// `date_start` and `date_end`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let hours = config.time_windows.iter().flat_map(|w| {
            let first = w.start_minute() / 60;
            let last = w.end_minute() / 60;
            (first..=last).filter_map(|h| u8::try_from(h).ok())
        });
        let days = config
            .dates()
            .into_iter()
            .filter_map(|d| u8::try_from(d.weekday().num_days_from_monday()).ok());
        Self::new(config.routes.iter().map(ToString::to_string), hours, days)
    }

    fn cells(&self) -> impl Iterator<Item = (String, u8, u8)> + '_ {
        self.routes.iter().flat_map(move |route| {
            self.hours.iter().flat_map(move |&hour| {
                self.days.iter().map(move |&day| (route.clone(), hour, day))
            })
        })
    }
}

/// Counters over every slice log on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceStats {
    pub attempts: usize,
    pub by_status: BTreeMap<String, usize>,
    pub details_failed: usize,
    pub hostile_responses: u64,
    pub rows_written: usize,
}

impl SliceStats {
    #[must_use]
    pub fn from_logs(logs: &[SliceLog]) -> Self {
        let mut stats = Self {
            attempts: logs.len(),
            ..Self::default()
        };
        for log in logs {
            *stats.by_status.entry(log.status.to_string()).or_default() += 1;
            stats.details_failed += log.details_failed;
            stats.hostile_responses += log.hostile_responses;
            stats.rows_written += log.rows_written;
        }
        stats
    }

    #[must_use]
    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaReport {
    pub verdict: QaVerdict,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub min_obs_per_cell: usize,
    pub total_cells: usize,
    pub sparse_cells: usize,
    pub total_observations: usize,
    pub coverage: Vec<CoverageCell>,
    pub monotonicity_violations: Vec<PercentileBucket>,
    pub route_medians: BTreeMap<String, f64>,
    pub slice_stats: SliceStats,
    pub generated_at: DateTime<Utc>,
}

fn median(values: &mut [usize]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) as f64 / 2.0
    } else {
        values[mid] as f64
    })
}

fn is_valid(bucket: &PercentileBucket) -> bool {
    bucket.obs_count == 0 || (bucket.p80 >= 0.0 && bucket.is_monotone())
}

/// Evaluate the gate over `buckets` against the `expected` grid with a
/// minimum of `min_obs` per cell.
///
/// Observed cells outside the grid are kept, so arrivals that spill past a
/// window's last hour still count.
#[must_use]
pub fn validate(
    buckets: &[PercentileBucket],
    expected: &CoverageGrid,
    min_obs: usize,
    logs: &[SliceLog],
) -> QaReport {
    let mut counts: BTreeMap<(String, u8, u8), usize> =
        expected.cells().map(|cell| (cell, 0)).collect();
    for b in buckets {
        *counts
            .entry((format!("{}->{}", b.origin, b.dest), b.hour, b.day_of_week))
            .or_default() += b.obs_count;
    }
    let coverage: Vec<CoverageCell> = counts
        .into_iter()
        .map(|((route, hour, day_of_week), obs_count)| CoverageCell {
            route,
            hour,
            day_of_week,
            obs_count,
            sparse: obs_count < min_obs,
        })
        .collect();
    let total_cells = coverage.len();
    let sparse_cells = coverage.iter().filter(|c| c.sparse).count();
    let total_observations = buckets.iter().map(|b| b.obs_count).sum();
    let monotonicity_violations: Vec<PercentileBucket> =
        buckets.iter().filter(|b| !is_valid(b)).cloned().collect();

    let mut per_route: BTreeMap<String, Vec<usize>> = expected
        .routes
        .iter()
        .map(|route| (route.clone(), Vec::new()))
        .collect();
    for cell in &coverage {
        per_route.entry(cell.route.clone()).or_default().push(cell.obs_count);
    }
    let silent_routes: Vec<&str> = expected
        .routes
        .iter()
        .filter(|route| {
            !coverage
                .iter()
                .any(|c| c.route == **route && c.obs_count > 0)
        })
        .map(String::as_str)
        .collect();
    let route_medians: BTreeMap<String, f64> = per_route
        .into_iter()
        .map(|(route, mut counts)| {
            let m = median(&mut counts).unwrap_or(0.0);
            (route, m)
        })
        .collect();

    let mut reasons = Vec::new();
    if total_observations == 0 {
        reasons.push("no observations collected".to_string());
    } else if !silent_routes.is_empty() {
        reasons.push(format!(
            "no observations for route(s) {}",
            silent_routes.join(", ")
        ));
    }
    if sparse_cells * 2 > total_cells {
        reasons.push(format!(
            "{sparse_cells} of {total_cells} cells have fewer than {min_obs} observations"
        ));
    }
    if !monotonicity_violations.is_empty() {
        reasons.push(format!(
            "{} buckets violate 0 <= p80 <= p90 <= p95",
            monotonicity_violations.len()
        ));
    }

    let mut warnings: Vec<String> = route_medians
        .iter()
        .filter(|(_, m)| **m < min_obs as f64)
        .map(|(route, m)| format!("route {route} median cell count {m:.1} is below {min_obs}"))
        .collect();
    let slice_stats = SliceStats::from_logs(logs);
    let failed_attempts = slice_stats.count(TaskStatus::Failed)
        + slice_stats.count(TaskStatus::Timeout)
        + slice_stats.count(TaskStatus::CircuitBreaker);
    if failed_attempts > 0 {
        warnings.push(format!(
            "{failed_attempts} of {} slice attempts did not succeed",
            slice_stats.attempts
        ));
    }

    let verdict = if reasons.is_empty() {
        QaVerdict::Pass
    } else {
        QaVerdict::Fail
    };
    QaReport {
        verdict,
        reasons,
        warnings,
        min_obs_per_cell: min_obs,
        total_cells,
        sparse_cells,
        total_observations,
        coverage,
        monotonicity_violations,
        route_medians,
        slice_stats,
        generated_at: Utc::now(),
    }
}

impl QaReport {
    /// Markdown rendering with one coverage matrix per route.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# QA report\n");
        let _ = writeln!(out, "Generated: {}\n", self.generated_at.to_rfc3339());
        let _ = writeln!(out, "**Verdict: {}**\n", self.verdict);
        for reason in &self.reasons {
            let _ = writeln!(out, "- {reason}");
        }
        if !self.reasons.is_empty() {
            out.push('\n');
        }

        let _ = writeln!(out, "## Coverage\n");
        let _ = writeln!(
            out,
            "{} cells, {} sparse (< {} observations), {} observations total.\n",
            self.total_cells, self.sparse_cells, self.min_obs_per_cell, self.total_observations
        );

        let mut by_route: BTreeMap<&str, BTreeMap<u8, [Option<(usize, bool)>; 7]>> =
            BTreeMap::new();
        for cell in &self.coverage {
            let row = by_route
                .entry(cell.route.as_str())
                .or_default()
                .entry(cell.hour)
                .or_insert([None; 7]);
            if let Some(slot) = row.get_mut(usize::from(cell.day_of_week)) {
                *slot = Some((cell.obs_count, cell.sparse));
            }
        }
        for (route, rows) in by_route {
            let median = self.route_medians.get(route).copied().unwrap_or_default();
            let _ = writeln!(out, "### {route} (median {median:.1})\n");
            let _ = writeln!(out, "| hour | {} |", DAY_NAMES.join(" | "));
            let _ = writeln!(out, "|---{}|", "|---".repeat(DAY_NAMES.len()));
            for (hour, days) in rows {
                let cells: Vec<String> = days
                    .iter()
                    .map(|slot| match slot {
                        Some((n, true)) => format!("{n}*"),
                        Some((n, false)) => n.to_string(),
                        None => "-".to_string(),
                    })
                    .collect();
                let _ = writeln!(out, "| {hour:02} | {} |", cells.join(" | "));
            }
            out.push('\n');
        }
        let _ = writeln!(out, "`*` marks a sparse cell.\n");

        if !self.monotonicity_violations.is_empty() {
            let _ = writeln!(out, "## Monotonicity violations\n");
            for b in &self.monotonicity_violations {
                let _ = writeln!(
                    out,
                    "- {}->{} hour {:02} {}: p80={:.2} p90={:.2} p95={:.2}",
                    b.origin,
                    b.dest,
                    b.hour,
                    DAY_NAMES.get(usize::from(b.day_of_week)).unwrap_or(&"?"),
                    b.p80,
                    b.p90,
                    b.p95
                );
            }
            out.push('\n');
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(out, "## Warnings\n");
            for warning in &self.warnings {
                let _ = writeln!(out, "- {warning}");
            }
            out.push('\n');
        }

        let _ = writeln!(out, "## Slice attempts\n");
        let _ = writeln!(out, "| status | attempts |\n|---|---|");
        for (status, n) in &self.slice_stats.by_status {
            let _ = writeln!(out, "| {status} | {n} |");
        }
        let _ = writeln!(
            out,
            "\nFailed detail lookups: {}. Hostile responses: {}. Rows written: {}.",
            self.slice_stats.details_failed,
            self.slice_stats.hostile_responses,
            self.slice_stats.rows_written
        );
        out
    }

    /// Write `qa_<timestamp>.md` and `qa_<timestamp>.json` under `dir`.
    pub fn write(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        fs::create_dir_all(dir)?;
        let stamp = self.generated_at.format("%Y%m%d_%H%M%S");
        let md_path = dir.join(format!("qa_{stamp}.md"));
        let json_path = dir.join(format!("qa_{stamp}.json"));
        fs::write(&md_path, self.to_markdown())?;
        fs::write(&json_path, serde_json::to_string_pretty(self)?)?;
        if self.verdict.passed() {
            info!(report = %md_path.display(), "QA passed");
        } else {
            warn!(report = %md_path.display(), reasons = ?self.reasons, "QA failed");
        }
        Ok((md_path, json_path))
    }
}
