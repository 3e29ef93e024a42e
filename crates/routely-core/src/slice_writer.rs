//! Per-task raw record files and per-attempt execution logs.
//!
//! Each task owns `raw_delays/delays_<task_key>.jsonl`, replaced atomically
//! on every successful attempt. Every attempt also leaves one immutable
//! `logs/slices/<task_key>.<attempt>.json`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::record::DelayRecord;
use crate::state_store::TaskMetadata;
use crate::task::{Task, TaskStatus};

/// Structured record of one task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceLog {
    pub task: String,
    pub route: String,
    pub date: String,
    pub window: String,
    pub attempt: u32,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub services_count: usize,
    pub rids_before_dedup: usize,
    pub rids_after_dedup: usize,
    pub rids_after_cap: usize,
    pub details_ok: usize,
    pub details_failed: usize,
    pub details_dropped: usize,
    pub rows_written: usize,
    pub metrics_secs: f64,
    pub details_secs: f64,
    pub hostile_responses: u64,
    pub window_splits: u32,
    pub timestamp: DateTime<Utc>,
}

impl SliceLog {
    #[must_use]
    pub fn new(task: &Task, status: TaskStatus, metadata: &TaskMetadata) -> Self {
        Self {
            task: task.key(),
            route: task.route.to_string(),
            date: task.date.to_string(),
            window: task.window.to_string(),
            attempt: metadata.attempt,
            status,
            error: metadata.error.clone(),
            services_count: metadata.services,
            rids_before_dedup: metadata.rids_before_dedup,
            rids_after_dedup: metadata.rids_after_dedup,
            rids_after_cap: metadata.rids_selected,
            details_ok: metadata.details_ok,
            details_failed: metadata.details_failed,
            details_dropped: metadata.details_dropped,
            rows_written: metadata.rows_written,
            metrics_secs: metadata.metrics_secs,
            details_secs: metadata.details_secs,
            hostile_responses: metadata.hostile_responses,
            window_splits: metadata.window_splits,
            timestamp: Utc::now(),
        }
    }
}

/// Writes slice outputs below a fixed pair of directories.
#[derive(Debug, Clone)]
pub struct SliceWriter {
    raw_dir: PathBuf,
    log_dir: PathBuf,
}

impl SliceWriter {
    #[must_use]
    pub fn new(raw_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            log_dir: log_dir.into(),
        }
    }

    /// Writer for the layout under `config.output_root`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.raw_delays_dir(), config.slice_logs_dir())
    }

    #[must_use]
    pub fn raw_path(&self, task_key: &str) -> PathBuf {
        self.raw_dir.join(format!("delays_{task_key}.jsonl"))
    }

    #[must_use]
    pub fn log_path(&self, task_key: &str, attempt: u32) -> PathBuf {
        self.log_dir.join(format!("{task_key}.{attempt}.json"))
    }

    /// Smallest attempt number without a log on disk, starting at 1.
    #[must_use]
    pub fn next_attempt(&self, task_key: &str) -> u32 {
        let mut attempt = 1;
        while self.log_path(task_key, attempt).exists() {
            attempt += 1;
        }
        attempt
    }

    /// Replace the task's raw record file. Returns the number of rows written.
    pub fn write_records(&self, task_key: &str, records: &[DelayRecord]) -> Result<usize> {
        fs::create_dir_all(&self.raw_dir)?;
        let path = self.raw_path(task_key);
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for record in records {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(task_key, rows = records.len(), path = %path.display(), "slice records written");
        Ok(records.len())
    }

    /// Write the log for one attempt. Existing logs are never overwritten.
    pub fn write_log(&self, log: &SliceLog) -> Result<PathBuf> {
        fs::create_dir_all(&self.log_dir)?;
        let path = self.log_path(&log.task, log.attempt);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, log)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(path)
    }

    /// Every readable slice log, ordered by file name.
    pub fn read_logs(&self) -> Result<Vec<SliceLog>> {
        let mut paths = json_files(&self.log_dir, "json")?;
        paths.sort();
        let mut logs = Vec::with_capacity(paths.len());
        for path in paths {
            match serde_json::from_reader(BufReader::new(File::open(&path)?)) {
                Ok(log) => logs.push(log),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable slice log"),
            }
        }
        Ok(logs)
    }

    /// Every record from every slice file, in file-name order.
    pub fn read_all_records(&self) -> Result<Vec<DelayRecord>> {
        let mut paths = json_files(&self.raw_dir, "jsonl")?;
        paths.sort();
        let mut records = Vec::new();
        for path in paths {
            records.extend(read_jsonl(&path)?);
        }
        Ok(records)
    }

    /// Delete every slice log. Returns how many files were removed.
    pub fn remove_logs(&self) -> Result<usize> {
        let paths = json_files(&self.log_dir, "json")?;
        for path in &paths {
            fs::remove_file(path)?;
        }
        Ok(paths.len())
    }
}

fn json_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
            out.push(path);
        }
    }
    Ok(out)
}

/// Read one JSONL file of delay records, skipping blank and malformed lines.
pub fn read_jsonl(path: &Path) -> Result<Vec<DelayRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(err) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %err,
                "skipping malformed record"
            ),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Route;
    use crate::window::TimeWindow;
    use chrono::NaiveDate;

    fn task() -> Task {
        Task::new(
            NaiveDate::from_ymd_opt(2025, 8, 27).unwrap(),
            Route::new("PAD", "BRI"),
            TimeWindow::parse("0600", "0659").unwrap(),
        )
    }

    fn record(rid: &str) -> DelayRecord {
        DelayRecord::from_times(
            "PAD",
            "BRI",
            rid,
            NaiveDate::from_ymd_opt(2025, 8, 27).unwrap(),
            "0630",
            "0634",
        )
        .unwrap()
    }

    fn writer(root: &Path) -> SliceWriter {
        SliceWriter::new(root.join("raw_delays"), root.join("logs").join("slices"))
    }

    #[test]
    fn records_are_replaced_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let key = task().key();
        writer.write_records(&key, &[record("A"), record("B")]).unwrap();
        writer.write_records(&key, &[record("C")]).unwrap();
        let all = writer.read_all_records().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].rid, "C");
        assert!(!writer.raw_path(&key).with_extension("jsonl.tmp").exists());
    }

    #[test]
    fn logs_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let task = task();
        assert_eq!(writer.next_attempt(&task.key()), 1);

        let metadata = TaskMetadata {
            attempt: 1,
            error: Some("boom".into()),
            ..TaskMetadata::default()
        };
        let log = SliceLog::new(&task, TaskStatus::Failed, &metadata);
        writer.write_log(&log).unwrap();
        assert!(writer.write_log(&log).is_err());
        assert_eq!(writer.next_attempt(&task.key()), 2);

        let logs = writer.read_logs().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].error.as_deref(), Some("boom"));
        assert_eq!(logs[0].window, "0600-0659");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        writer.write_records("k", &[record("A")]).unwrap();
        let path = writer.raw_path("k");
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str("{not json}\n\n");
        fs::write(&path, raw).unwrap();
        assert_eq!(read_jsonl(&path).unwrap().len(), 1);
    }

    #[test]
    fn missing_directories_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(&dir.path().join("nowhere"));
        assert!(writer.read_all_records().unwrap().is_empty());
        assert!(writer.read_logs().unwrap().is_empty());
        assert_eq!(writer.remove_logs().unwrap(), 0);
    }
}
