//! Row sources: databases watched through a monotonically growing cursor
//! column.
//!
//! A poll wraps the configured query as
//! `SELECT MAX(col), COUNT(*) FROM (<query>) WHERE col > <last>` so the
//! database does the diffing and only one summary row crosses the wire.

use std::path::{Path, PathBuf};

use assetflow_types::cursor::{RowBatch, RowKey};
use assetflow_types::error::ConnectorError;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value};

/// Config key holding the watched query.
pub const QUERY_KEY: &str = "query";
/// Config key naming the cursor column of the query's result.
pub const CURSOR_COLUMN_KEY: &str = "cursor_column";

/// What a row source polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    /// Base query without a trailing `;`.
    pub sql: String,
    pub cursor_column: String,
}

impl RowQuery {
    /// Build from rendered sensor configs.
    ///
    /// # Errors
    ///
    /// Returns a message when `query` or `cursor_column` is missing, or the
    /// column is not a plain identifier.
    pub fn from_configs(configs: &Map<String, Value>) -> Result<Self, String> {
        let sql = configs
            .get(QUERY_KEY)
            .and_then(Value::as_str)
            .map(|q| q.trim().trim_end_matches(';').trim_end())
            .filter(|q| !q.is_empty())
            .ok_or_else(|| format!("configs must set '{QUERY_KEY}'"))?;
        let column = configs
            .get(CURSOR_COLUMN_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("configs must set '{CURSOR_COLUMN_KEY}'"))?;
        check_identifier(column)?;
        Ok(Self {
            sql: sql.to_string(),
            cursor_column: column.to_string(),
        })
    }

    /// Summary statement; `?1` binds the previous cursor or NULL.
    #[must_use]
    pub fn window_sql(&self) -> String {
        let col = &self.cursor_column;
        format!(
            "SELECT MAX(w.{col}), COUNT(*) FROM ({}) AS w WHERE ?1 IS NULL OR w.{col} > ?1",
            self.sql
        )
    }
}

/// The column name is spliced into SQL, so only bare identifiers pass.
fn check_identifier(column: &str) -> Result<(), String> {
    let mut chars = column.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(format!("'{CURSOR_COLUMN_KEY}' must be a plain column name, got '{column}'"))
    }
}

/// Read side of a database connection, as seen by discovery.
pub trait RowSource: Send + Sync {
    /// Summarize the rows whose cursor column lies beyond `after`.
    ///
    /// Returns `None` when there are none.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] when the query fails or the cursor
    /// column holds a type that cannot be a cursor.
    fn next_batch(
        &self,
        query: &RowQuery,
        after: Option<&RowKey>,
    ) -> Result<Option<RowBatch>, ConnectorError>;
}

/// [`RowSource`] over a `SQLite` database file, opened read-only per poll.
#[derive(Debug, Clone)]
pub struct SqliteRowSource {
    path: PathBuf,
}

impl SqliteRowSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, ConnectorError> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            ConnectorError::not_found(
                "DB_OPEN",
                format!("cannot open database {}: {e}", self.path.display()),
            )
        })
    }
}

fn classify(err: &rusqlite::Error) -> ConnectorError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
            ConnectorError::transient_network("DB_BUSY", err.to_string())
        }
        Some(rusqlite::ErrorCode::PermissionDenied | rusqlite::ErrorCode::ReadOnly) => {
            ConnectorError::permission("DB_DENIED", err.to_string())
        }
        // SQLITE_ERROR: the query does not prepare or run as written.
        Some(rusqlite::ErrorCode::Unknown) => ConnectorError::config("DB_QUERY", err.to_string()),
        _ => ConnectorError::internal("DB_QUERY", err.to_string()),
    }
}

fn to_sql(key: Option<&RowKey>) -> SqlValue {
    match key {
        None => SqlValue::Null,
        Some(RowKey::Int(v)) => SqlValue::Integer(*v),
        Some(RowKey::Text(v)) => SqlValue::Text(v.clone()),
    }
}

fn from_sql(column: &str, value: SqlValue) -> Result<Option<RowKey>, ConnectorError> {
    match value {
        SqlValue::Null => Ok(None),
        SqlValue::Integer(v) => Ok(Some(RowKey::Int(v))),
        SqlValue::Text(v) => Ok(Some(RowKey::Text(v))),
        SqlValue::Real(_) | SqlValue::Blob(_) => Err(ConnectorError::config(
            "CURSOR_TYPE",
            format!("cursor column '{column}' must hold integers or text"),
        )),
    }
}

impl RowSource for SqliteRowSource {
    fn next_batch(
        &self,
        query: &RowQuery,
        after: Option<&RowKey>,
    ) -> Result<Option<RowBatch>, ConnectorError> {
        let conn = self.connect()?;
        let (upper, count): (SqlValue, i64) = conn
            .query_row(&query.window_sql(), [to_sql(after)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(|e| classify(&e))?;

        let Some(upper) = from_sql(&query.cursor_column, upper)? else {
            return Ok(None);
        };
        let record_count = u64::try_from(count).unwrap_or(0);
        if record_count == 0 {
            return Ok(None);
        }
        Ok(Some(RowBatch {
            cursor_column: query.cursor_column.clone(),
            last: after.cloned(),
            upper,
            record_count,
        }))
    }
}
