//! Durable task-state store.
//!
//! [`StateStore`] is the single source of truth for resume and retry. The
//! SQLite implementation commits every `set` before returning, so a crash
//! after a transition never loses it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::task::{Task, TaskStatus};

/// Current schema version written to `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const STATE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    task_key      TEXT NOT NULL UNIQUE,
    status        TEXT NOT NULL,
    task_json     TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE TABLE IF NOT EXISTS run_metadata (
    key        TEXT PRIMARY KEY,
    value_json TEXT NOT NULL
);
";

/// Outcome details persisted alongside a status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskMetadata {
    /// Attempt that produced this status, starting at 1.
    pub attempt: u32,
    pub error: Option<String>,
    pub services: usize,
    pub rids_before_dedup: usize,
    pub rids_after_dedup: usize,
    pub rids_selected: usize,
    pub details_ok: usize,
    pub details_failed: usize,
    pub details_dropped: usize,
    pub rows_written: usize,
    pub metrics_secs: f64,
    pub details_secs: f64,
    pub hostile_responses: u64,
    pub window_splits: u32,
    /// Keys of the child tasks a bisected task was replaced by.
    pub children: Vec<String>,
}

/// One persisted task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    pub metadata: TaskMetadata,
    pub updated_at: String,
}

/// Durable, idempotent record of task lifecycle status.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<TaskStatus>, StorageError>;

    fn get_record(&self, key: &str) -> Result<Option<TaskRecord>, StorageError>;

    /// Persist `status` and `metadata` for `task`, replacing any earlier entry.
    fn set(&self, task: &Task, status: TaskStatus, metadata: &TaskMetadata)
    -> Result<(), StorageError>;

    /// Insert `task` as pending unless it already has an entry. Returns
    /// whether a row was inserted.
    fn ensure_pending(&self, task: &Task) -> Result<bool, StorageError>;

    /// All records in first-insertion order.
    fn list(&self) -> Result<Vec<TaskRecord>, StorageError>;

    fn counts(&self) -> Result<BTreeMap<TaskStatus, usize>, StorageError>;

    /// Remove `failed`, `timeout` and `circuit_breaker` entries.
    fn clear_failures(&self) -> Result<usize, StorageError>;

    /// Remove every task and all run metadata.
    fn clear(&self) -> Result<(), StorageError>;

    fn set_run_metadata(&self, key: &str, value: &Value) -> Result<(), StorageError>;

    fn run_metadata(&self, key: &str) -> Result<Option<Value>, StorageError>;

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.counts()?.values().all(|&n| n == 0))
    }
}

/// SQLite-backed [`StateStore`].
#[derive(Debug)]
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Database(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA busy_timeout=5000;",
        )?;
        let store = Self::init(conn)?;
        debug!(path = %path.display(), "state store opened");
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::SchemaTooNew {
                current,
                supported: SCHEMA_VERSION,
            });
        }
        conn.execute_batch(STATE_SCHEMA)?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Database("state store lock poisoned".to_string()))
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Database(e.to_string()))
}

fn from_json<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Database(e.to_string()))
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

type RawRow = (String, String, String, String);

fn decode_row(raw: RawRow) -> Result<TaskRecord, StorageError> {
    let (status, task_json, metadata_json, updated_at) = raw;
    Ok(TaskRecord {
        task: from_json(&task_json)?,
        status: status.parse()?,
        metadata: from_json(&metadata_json)?,
        updated_at,
    })
}

impl StateStore for SqliteStateStore {
    fn get(&self, key: &str) -> Result<Option<TaskStatus>, StorageError> {
        let conn = self.conn()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE task_key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        status.map(|s| s.parse()).transpose()
    }

    fn get_record(&self, key: &str) -> Result<Option<TaskRecord>, StorageError> {
        let conn = self.conn()?;
        let raw: Option<RawRow> = conn
            .query_row(
                "SELECT status, task_json, metadata_json, updated_at FROM tasks WHERE task_key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        raw.map(decode_row).transpose()
    }

    fn set(
        &self,
        task: &Task,
        status: TaskStatus,
        metadata: &TaskMetadata,
    ) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (task_key, status, task_json, metadata_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(task_key) DO UPDATE SET
                status = excluded.status,
                task_json = excluded.task_json,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at",
            params![
                task.key(),
                status.as_str(),
                to_json(task)?,
                to_json(metadata)?,
                now_rfc3339()
            ],
        )?;
        debug!(task_key = %task.key(), status = %status, "state persisted");
        Ok(())
    }

    fn ensure_pending(&self, task: &Task) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tasks (task_key, status, task_json, metadata_json, updated_at)
             VALUES (?1, ?2, ?3, '{}', ?4)",
            params![
                task.key(),
                TaskStatus::Pending.as_str(),
                to_json(task)?,
                now_rfc3339()
            ],
        )?;
        Ok(inserted > 0)
    }

    fn list(&self) -> Result<Vec<TaskRecord>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, task_json, metadata_json, updated_at FROM tasks ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<Result<Vec<RawRow>, _>>()?;
        rows.into_iter().map(decode_row).collect()
    }

    fn counts(&self) -> Result<BTreeMap<TaskStatus, usize>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut counts: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for (status, n) in rows {
            counts.insert(status.parse()?, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    fn clear_failures(&self) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM tasks WHERE status IN (?1, ?2, ?3)",
            params![
                TaskStatus::Failed.as_str(),
                TaskStatus::Timeout.as_str(),
                TaskStatus::CircuitBreaker.as_str()
            ],
        )?;
        info!(removed, "cleared failed task entries");
        Ok(removed)
    }

    fn clear(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch("DELETE FROM tasks; DELETE FROM run_metadata;")?;
        info!("state store wiped");
        Ok(())
    }

    fn set_run_metadata(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO run_metadata (key, value_json) VALUES (?1, ?2)",
            params![key, to_json(value)?],
        )?;
        Ok(())
    }

    fn run_metadata(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value_json FROM run_metadata WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Route;
    use crate::window::TimeWindow;
    use chrono::NaiveDate;

    fn task(from: &str, to: &str) -> Task {
        Task::new(
            NaiveDate::from_ymd_opt(2025, 8, 27).unwrap(),
            Route::new("PAD", "BRI"),
            TimeWindow::parse(from, to).unwrap(),
        )
    }

    #[test]
    fn set_then_get() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let t = task("0600", "0659");
        assert_eq!(store.get(&t.key()).unwrap(), None);

        let metadata = TaskMetadata {
            attempt: 1,
            rows_written: 12,
            ..TaskMetadata::default()
        };
        store.set(&t, TaskStatus::Ok, &metadata).unwrap();
        assert_eq!(store.get(&t.key()).unwrap(), Some(TaskStatus::Ok));
        let record = store.get_record(&t.key()).unwrap().unwrap();
        assert_eq!(record.task, t);
        assert_eq!(record.metadata.rows_written, 12);
    }

    #[test]
    fn ensure_pending_does_not_overwrite() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let t = task("0600", "0659");
        assert!(store.ensure_pending(&t).unwrap());
        store.set(&t, TaskStatus::Ok, &TaskMetadata::default()).unwrap();
        assert!(!store.ensure_pending(&t).unwrap());
        assert_eq!(store.get(&t.key()).unwrap(), Some(TaskStatus::Ok));
    }

    #[test]
    fn list_keeps_insertion_order_across_updates() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let a = task("0600", "0659");
        let b = task("0700", "0759");
        store.ensure_pending(&a).unwrap();
        store.ensure_pending(&b).unwrap();
        store.set(&a, TaskStatus::Failed, &TaskMetadata::default()).unwrap();
        let keys: Vec<String> = store.list().unwrap().iter().map(|r| r.task.key()).collect();
        assert_eq!(keys, vec![a.key(), b.key()]);
    }

    #[test]
    fn clear_failures_is_selective() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let statuses = [
            ("0000", "0059", TaskStatus::Ok),
            ("0100", "0159", TaskStatus::Failed),
            ("0200", "0259", TaskStatus::Timeout),
            ("0300", "0359", TaskStatus::CircuitBreaker),
            ("0400", "0459", TaskStatus::Skipped),
            ("0500", "0559", TaskStatus::Bisected),
        ];
        for (from, to, status) in statuses {
            store.set(&task(from, to), status, &TaskMetadata::default()).unwrap();
        }
        assert_eq!(store.clear_failures().unwrap(), 3);
        let counts = store.counts().unwrap();
        assert_eq!(counts[&TaskStatus::Ok], 1);
        assert_eq!(counts[&TaskStatus::Failed], 0);
        assert_eq!(counts[&TaskStatus::Bisected], 1);
    }

    #[test]
    fn clear_wipes_tasks_and_metadata() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store.ensure_pending(&task("0600", "0659")).unwrap();
        store
            .set_run_metadata("planned_tasks", &serde_json::json!(1))
            .unwrap();
        store.clear().unwrap();
        assert!(store.is_empty().unwrap());
        assert_eq!(store.run_metadata("planned_tasks").unwrap(), None);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("state.db");
        let t = task("0600", "0659");
        {
            let store = SqliteStateStore::open(&path).unwrap();
            store.set(&t, TaskStatus::Skipped, &TaskMetadata::default()).unwrap();
        }
        let store = SqliteStateStore::open(&path).unwrap();
        assert_eq!(store.get(&t.key()).unwrap(), Some(TaskStatus::Skipped));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 99;").unwrap();
        }
        let err = SqliteStateStore::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::SchemaTooNew { current: 99, .. }));
    }
}
