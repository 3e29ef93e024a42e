//! Merge slice outputs into the deduplicated dataset and percentile table.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::record::{DelayRecord, PercentileBucket};
use crate::slice_writer::SliceWriter;

/// Header of the percentile table.
pub const PERCENTILE_CSV_HEADER: &str = "origin,dest,hour,day_of_week,p80,p90,p95,obs_count";

/// Linear-interpolation percentile of ascending `sorted` values.
///
/// Rank is `p / 100 * (n - 1)`; the result interpolates between the two
/// bracketing order statistics. `None` for an empty slice.
#[must_use]
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (p / 100.0).clamp(0.0, 1.0) * last as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    Some(sorted[lower] + fraction * (sorted[upper] - sorted[lower]))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Keep the first record for every `(rid, dest)` identity.
#[must_use]
pub fn dedup_records(records: Vec<DelayRecord>) -> Vec<DelayRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert((r.rid.clone(), r.dest.clone())))
        .collect()
}

/// One bucket per `(origin, dest, hour, day_of_week)`, in key order.
#[must_use]
pub fn compute_buckets(records: &[DelayRecord]) -> Vec<PercentileBucket> {
    let mut cells: BTreeMap<(&str, &str, u8, u8), Vec<f64>> = BTreeMap::new();
    for r in records {
        cells
            .entry((&r.origin, &r.dest, r.hour, r.day_of_week))
            .or_default()
            .push(f64::from(r.delay_minutes));
    }

    cells
        .into_iter()
        .filter_map(|((origin, dest, hour, day_of_week), mut delays)| {
            delays.sort_by(f64::total_cmp);
            Some(PercentileBucket {
                origin: origin.to_string(),
                dest: dest.to_string(),
                hour,
                day_of_week,
                p80: round2(percentile(&delays, 80.0)?),
                p90: round2(percentile(&delays, 90.0)?),
                p95: round2(percentile(&delays, 95.0)?),
                obs_count: delays.len(),
            })
        })
        .collect()
}

/// Result of one aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// Deduplicated records.
    pub records: Vec<DelayRecord>,
    pub duplicates_removed: usize,
    pub buckets: Vec<PercentileBucket>,
}

/// Reads every slice and writes the merged outputs.
#[derive(Debug, Clone)]
pub struct Aggregator {
    slices: SliceWriter,
    dataset_path: PathBuf,
    percentiles_path: PathBuf,
}

impl Aggregator {
    #[must_use]
    pub fn new(
        slices: SliceWriter,
        dataset_path: impl Into<PathBuf>,
        percentiles_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            slices,
            dataset_path: dataset_path.into(),
            percentiles_path: percentiles_path.into(),
        }
    }

    /// Merge, deduplicate and summarise. Raw slices are only read.
    pub fn run(&self) -> Result<Aggregation> {
        let raw = self.slices.read_all_records()?;
        let total = raw.len();
        let records = dedup_records(raw);
        let buckets = compute_buckets(&records);

        write_dataset(&self.dataset_path, &records)?;
        write_percentiles(&self.percentiles_path, &buckets)?;

        let aggregation = Aggregation {
            duplicates_removed: total - records.len(),
            records,
            buckets,
        };
        info!(
            records = aggregation.records.len(),
            duplicates = aggregation.duplicates_removed,
            buckets = aggregation.buckets.len(),
            dataset = %self.dataset_path.display(),
            "aggregation complete"
        );
        Ok(aggregation)
    }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

pub fn write_dataset(path: &Path, records: &[DelayRecord]) -> Result<()> {
    let mut out = create(path)?;
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_percentiles(path: &Path, buckets: &[PercentileBucket]) -> Result<()> {
    let mut out = create(path)?;
    writeln!(out, "{PERCENTILE_CSV_HEADER}")?;
    for b in buckets {
        writeln!(
            out,
            "{},{},{},{},{:.2},{:.2},{:.2},{}",
            b.origin, b.dest, b.hour, b.day_of_week, b.p80, b.p90, b.p95, b.obs_count
        )?;
    }
    out.flush()?;
    Ok(())
}
