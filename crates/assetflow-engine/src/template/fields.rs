//! Which configuration fields are subject to template rendering.
//!
//! The table is built once and never mutated; everything else is rendered
//! verbatim so raw regexes and SQL never see expression substitution.

use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Field holding a per-item boolean expression. It is evaluated for each
/// candidate item rather than rendered up front.
pub const PREDICATE_FIELD: &str = "predicate";

/// Family of operation a config block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ObjectStore,
    RemoteFile,
    Database,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ObjectStore => "object_store",
            Self::RemoteFile => "remote_file",
            Self::Database => "database",
        })
    }
}

/// Immutable whitelist of templated field names.
#[derive(Debug)]
pub struct TemplateFields {
    object_store: &'static [&'static str],
    remote_file: &'static [&'static str],
    database: &'static [&'static str],
    format_options: &'static [&'static str],
}

static STANDARD: LazyLock<TemplateFields> = LazyLock::new(|| TemplateFields {
    object_store: &["bucket_name", "key", "prefix", "pattern", PREDICATE_FIELD],
    remote_file: &["path", "pattern", "file_name", PREDICATE_FIELD],
    database: &["query", "table_name", "schema_name", "sql_pre", "sql_post"],
    format_options: &["delimiter", "quotechar", "escapechar"],
});

impl TemplateFields {
    /// The process-wide table.
    #[must_use]
    pub fn standard() -> &'static Self {
        &STANDARD
    }

    #[must_use]
    pub fn for_kind(&self, kind: OperationKind) -> &'static [&'static str] {
        match kind {
            OperationKind::ObjectStore => self.object_store,
            OperationKind::RemoteFile => self.remote_file,
            OperationKind::Database => self.database,
        }
    }

    #[must_use]
    pub fn format_options(&self) -> &'static [&'static str] {
        self.format_options
    }

    /// Whether `field` is rendered for operations of `kind`.
    #[must_use]
    pub fn is_whitelisted(&self, kind: OperationKind, field: &str) -> bool {
        self.for_kind(kind).contains(&field) || self.format_options.contains(&field)
    }
}
