//! `SQLite`-backed implementation of [`CursorStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Cursor values are
//! stored as JSON so every [`CursorValue`](assetflow_types::cursor::CursorValue)
//! variant fits one column.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use assetflow_types::state::{
    CursorRecord, PartitionKey, RunRecord, RunStats, RunStatus, SensorName,
};
use chrono::{NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::backend::CursorStore;
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Partition column value for unpartitioned cursors. A primary key column
/// cannot hold a usable NULL, so the absent partition is the empty string.
const NO_PARTITION: &str = "";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS sensor_cursors (
    sensor TEXT NOT NULL,
    partition_key TEXT NOT NULL DEFAULT '',
    cursor_json TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (sensor, partition_key)
);

CREATE TABLE IF NOT EXISTS claimed_run_keys (
    run_key TEXT PRIMARY KEY,
    claimed_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS asset_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset TEXT NOT NULL,
    run_key TEXT,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    items_succeeded INTEGER DEFAULT 0,
    items_failed INTEGER DEFAULT 0,
    items_skipped INTEGER DEFAULT 0,
    bytes_moved INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_asset_runs_asset ON asset_runs (asset, id);
";

/// `SQLite`-backed cursor storage.
///
/// Create with [`SqliteCursorStore::open`] for file-backed persistence
/// or [`SqliteCursorStore::in_memory`] for tests.
pub struct SqliteCursorStore {
    conn: Mutex<Connection>,
}

impl SqliteCursorStore {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::SqliteContext`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| StateError::context("open", e))?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::SqliteContext`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::context("open", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::context("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    /// Convert an ISO-8601 string to `SQLite` datetime format, falling back
    /// to the current time for unparseable input.
    fn iso8601_to_sqlite(iso: &str) -> String {
        chrono::DateTime::parse_from_rfc3339(iso).map_or_else(
            |_| Self::now_sqlite(),
            |dt| dt.with_timezone(&Utc).format(SQLITE_DATETIME_FMT).to_string(),
        )
    }

    fn partition_column(partition: Option<&PartitionKey>) -> &str {
        partition.map_or(NO_PARTITION, PartitionKey::as_str)
    }

    #[cfg(test)]
    fn get_run_row(
        &self,
        run_id: i64,
    ) -> error::Result<(String, i64, Option<String>, Option<String>)> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT status, items_succeeded, finished_at, error_message \
             FROM asset_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(StateError::from)
    }
}

impl CursorStore for SqliteCursorStore {
    fn read(
        &self,
        sensor: &SensorName,
        partition: Option<&PartitionKey>,
    ) -> error::Result<Option<CursorRecord>> {
        let conn = self.lock_conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT cursor_json, updated_at FROM sensor_cursors \
                 WHERE sensor = ?1 AND partition_key = ?2",
                rusqlite::params![sensor.as_str(), Self::partition_column(partition)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StateError::context("read cursor", e))?;

        match row {
            Some((cursor_json, updated_at)) => Ok(Some(CursorRecord {
                value: serde_json::from_str(&cursor_json)?,
                updated_at: Self::sqlite_to_iso8601(&updated_at),
            })),
            None => Ok(None),
        }
    }

    fn write(
        &self,
        sensor: &SensorName,
        partition: Option<&PartitionKey>,
        record: &CursorRecord,
    ) -> error::Result<()> {
        let cursor_json = serde_json::to_string(&record.value)?;
        let updated_at = Self::iso8601_to_sqlite(&record.updated_at);
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sensor_cursors (sensor, partition_key, cursor_json, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(sensor, partition_key) \
             DO UPDATE SET cursor_json = ?3, updated_at = ?4",
            rusqlite::params![
                sensor.as_str(),
                Self::partition_column(partition),
                cursor_json,
                updated_at,
            ],
        )
        .map_err(|e| StateError::context("write cursor", e))?;
        Ok(())
    }

    fn clear(&self, sensor: &SensorName, partition: Option<&PartitionKey>) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM sensor_cursors WHERE sensor = ?1 AND partition_key = ?2",
                rusqlite::params![sensor.as_str(), Self::partition_column(partition)],
            )
            .map_err(|e| StateError::context("clear cursor", e))?;
        Ok(deleted > 0)
    }

    fn claim_run_key(&self, run_key: &str) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO claimed_run_keys (run_key, claimed_at) VALUES (?1, ?2)",
                rusqlite::params![run_key, Self::now_sqlite()],
            )
            .map_err(|e| StateError::context("claim run key", e))?;
        Ok(inserted > 0)
    }

    fn release_run_key(&self, run_key: &str) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM claimed_run_keys WHERE run_key = ?1",
            rusqlite::params![run_key],
        )
        .map_err(|e| StateError::context("release run key", e))?;
        Ok(())
    }

    fn start_run(&self, asset: &str, run_key: Option<&str>) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO asset_runs (asset, run_key, status) VALUES (?1, ?2, ?3)",
            rusqlite::params![asset, run_key, RunStatus::Running.as_str()],
        )
        .map_err(|e| StateError::context("start run", e))?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE asset_runs SET status = ?1, finished_at = datetime('now'), \
             items_succeeded = ?2, items_failed = ?3, items_skipped = ?4, bytes_moved = ?5, \
             error_message = ?6 WHERE id = ?7",
            rusqlite::params![
                status.as_str(),
                stats.items_succeeded as i64,
                stats.items_failed as i64,
                stats.items_skipped as i64,
                stats.bytes_moved as i64,
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StateError::context("complete run", e))?;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn recent_runs(&self, asset: &str, limit: usize) -> error::Result<Vec<RunRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, asset, run_key, status, started_at, finished_at, items_succeeded, \
                 items_failed, items_skipped, bytes_moved, error_message \
                 FROM asset_runs WHERE asset = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| StateError::context("list runs", e))?;
        let rows = stmt
            .query_map(rusqlite::params![asset, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    [
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, i64>(9)?,
                    ],
                    row.get::<_, Option<String>>(10)?,
                ))
            })
            .map_err(|e| StateError::context("list runs", e))?;

        let mut runs = Vec::new();
        for row in rows {
            let (id, asset, run_key, status, started_at, finished_at, counts, error_message) =
                row.map_err(|e| StateError::context("list runs", e))?;
            let status = RunStatus::parse(&status)
                .ok_or_else(|| StateError::Corrupt(format!("run {id} has status '{status}'")))?;
            let [succeeded, failed, skipped, bytes] = counts;
            runs.push(RunRecord {
                id,
                asset,
                run_key,
                status,
                started_at: Self::sqlite_to_iso8601(&started_at),
                finished_at: finished_at.as_deref().map(Self::sqlite_to_iso8601),
                stats: RunStats {
                    items_succeeded: succeeded as u64,
                    items_failed: failed as u64,
                    items_skipped: skipped as u64,
                    bytes_moved: bytes as u64,
                    error_message,
                },
            });
        }
        Ok(runs)
    }
}
