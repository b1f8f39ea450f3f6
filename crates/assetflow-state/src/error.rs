//! Cursor store error types.

/// Errors produced by [`CursorStore`](crate::CursorStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `SQLite` failure annotated with the operation that hit it.
    #[error("{operation}: {source}")]
    SqliteContext {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Stored cursor could not be encoded or decoded.
    #[error("cursor encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("cursor store lock poisoned")]
    LockPoisoned,

    /// A stored row holds a value this version does not understand.
    #[error("corrupt state row: {0}")]
    Corrupt(String),
}

impl StateError {
    /// Wrap a `SQLite` error with the name of the failing operation.
    #[must_use]
    pub fn context(operation: &'static str, source: rusqlite::Error) -> Self {
        Self::SqliteContext { operation, source }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
