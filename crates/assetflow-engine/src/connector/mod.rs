//! Source and target connector seams.
//!
//! Connectors are synchronous; the discovery and transfer engines call them
//! from `spawn_blocking` so listing and streaming never block the runtime.

mod local_fs;
mod object_store;
mod registry;
mod rows;
mod staged;

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use assetflow_types::error::ConnectorError;
use assetflow_types::item::{ItemKind, SourceItem};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub use local_fs::{LocalFileSource, LocalFileTarget};
pub use object_store::LocalObjectStore;
pub use registry::{
    ConnectorRegistry, RowFactory, SourceFactory, TargetFactory, DATABASE_PATH_KEY, ROOT_DIR_KEY,
};
pub use rows::{RowQuery, RowSource, SqliteRowSource, CURSOR_COLUMN_KEY, QUERY_KEY};
pub use staged::StagedFileWriter;

/// One listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    /// Directory (`path`) for file sources, bucket for object stores.
    pub location: String,
    /// Key prefix inside the bucket; unused by file sources.
    pub prefix: Option<String>,
    pub recursive: bool,
    pub page_size: usize,
}

/// A page of listed items plus the token for the next page.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<SourceItem>,
    pub continuation: Option<String>,
}

/// Read side of a connection.
pub trait SourceConnector: Send + Sync {
    /// Variant of the items this source lists.
    fn item_kind(&self) -> ItemKind;

    /// List one page. `continuation` is the token returned by the previous
    /// page, `None` for the first.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] when the location cannot be listed.
    fn list_page(
        &self,
        request: &ListRequest,
        continuation: Option<&str>,
    ) -> Result<ListPage, ConnectorError>;

    /// Fresh metadata for an already listed item.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] when the item no longer exists or cannot
    /// be inspected.
    fn stat(&self, item: &SourceItem) -> Result<SourceItem, ConnectorError>;

    /// Open the item's content for streaming.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] when the item cannot be opened.
    fn open(&self, item: &SourceItem) -> Result<Box<dyn Read + Send>, ConnectorError>;
}

/// Where a transferred item lands.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetLocation {
    /// Bucket for object stores, directory for file targets.
    pub container: String,
    pub key: String,
    /// Rendered target configs not consumed by location resolution
    /// (format options, database lifecycle statements, ...).
    pub options: Map<String, Value>,
}

impl TargetLocation {
    /// `container/key` for logs and failure reports.
    #[must_use]
    pub fn display(&self) -> String {
        if self.container.is_empty() {
            self.key.clone()
        } else {
            format!("{}/{}", self.container.trim_end_matches('/'), self.key)
        }
    }
}

/// Write side of a connection.
pub trait TargetConnector: Send + Sync {
    /// Open a writer for `location`. Nothing is visible at the location
    /// until the writer commits.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] when the location is invalid or cannot
    /// be prepared.
    fn open_writer(
        &self,
        location: &TargetLocation,
    ) -> Result<Box<dyn TargetWriter>, ConnectorError>;
}

/// Streaming writer for one target object.
pub trait TargetWriter: Write + Send {
    /// Publish the written bytes, replacing anything at the location.
    /// Returns the number of bytes published.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] when publishing fails; the location is
    /// left as it was.
    fn commit(self: Box<Self>) -> Result<u64, ConnectorError>;

    /// Discard everything written.
    fn abort(self: Box<Self>);
}

/// Join a remote-style path (`/out/a.csv`, `raw/x.json`) under `root`,
/// refusing anything that would escape it.
pub(crate) fn resolve_under(root: &Path, remote: &str) -> Result<PathBuf, ConnectorError> {
    let relative = Path::new(remote.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(ConnectorError::config(
            "INVALID_PATH",
            format!("path '{remote}' escapes the connection root"),
        ));
    }
    Ok(root.join(relative))
}

/// Modification time of `meta` in epoch seconds.
pub(crate) fn modified_secs(meta: &std::fs::Metadata) -> Result<i64, ConnectorError> {
    let modified = meta
        .modified()
        .map_err(|e| ConnectorError::from_io("STAT_FAILED", &e))?;
    Ok(DateTime::<Utc>::from(modified).timestamp())
}

/// Parse an offset continuation token.
pub(crate) fn parse_offset(continuation: Option<&str>) -> Result<usize, ConnectorError> {
    continuation.map_or(Ok(0), |token| {
        token.parse().map_err(|_| {
            ConnectorError::internal(
                "BAD_CONTINUATION",
                format!("invalid continuation token '{token}'"),
            )
        })
    })
}

/// Slice `entries` into a page starting at `offset`.
pub(crate) fn page_of<T>(
    entries: Vec<T>,
    offset: usize,
    page_size: usize,
) -> (Vec<T>, Option<String>) {
    let total = entries.len();
    let page_size = page_size.max(1);
    let page: Vec<T> = entries.into_iter().skip(offset).take(page_size).collect();
    let next = offset + page.len();
    let continuation = (next < total).then(|| next.to_string());
    (page, continuation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_under_rejects_escapes() {
        let root = Path::new("/srv/data");
        assert_eq!(resolve_under(root, "/out/a.csv").unwrap(), root.join("out/a.csv"));
        assert!(resolve_under(root, "../etc/passwd").is_err());
        assert!(resolve_under(root, "/out/../../x").is_err());
    }

    #[test]
    fn pages_carry_offsets() {
        let (page, next) = page_of((0..5).collect(), 0, 2);
        assert_eq!(page, vec![0, 1]);
        assert_eq!(next.as_deref(), Some("2"));
        let (page, next) = page_of((0..5).collect(), 4, 2);
        assert_eq!(page, vec![4]);
        assert!(next.is_none());
    }

    #[test]
    fn offset_tokens() {
        assert_eq!(parse_offset(None).unwrap(), 0);
        assert_eq!(parse_offset(Some("7")).unwrap(), 7);
        assert!(parse_offset(Some("x")).is_err());
    }

    #[test]
    fn location_display() {
        let loc = TargetLocation {
            container: "raw/".into(),
            key: "a/b.csv".into(),
            options: Map::new(),
        };
        assert_eq!(loc.display(), "raw/a/b.csv");
    }
}
