//! File-system backed remote-file connectors (`sftp` / `local` with a
//! `root_dir`). Remote paths such as `/outbound/a.csv` map under the root.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use assetflow_types::error::ConnectorError;
use assetflow_types::item::{FileMeta, ItemKind, SourceItem};
use walkdir::WalkDir;

use super::{
    modified_secs, page_of, parse_offset, resolve_under, ListPage, ListRequest, SourceConnector,
    StagedFileWriter, TargetConnector, TargetLocation, TargetWriter,
};

/// Lists [`FileMeta`] items below a directory.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    root: PathBuf,
}

impl LocalFileSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_of<'a>(&self, item: &'a SourceItem) -> Result<&'a FileMeta, ConnectorError> {
        match item {
            SourceItem::File(f) => Ok(f),
            SourceItem::Object(_) => Err(ConnectorError::config(
                "WRONG_ITEM_KIND",
                format!("file source cannot read object item '{}'", item.identity()),
            )),
        }
    }
}

fn remote_join(dir: &str, relative: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{relative}")
    } else {
        format!("{dir}/{relative}")
    }
}

fn relative_slash_path(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

impl SourceConnector for LocalFileSource {
    fn item_kind(&self) -> ItemKind {
        ItemKind::File
    }

    fn list_page(
        &self,
        request: &ListRequest,
        continuation: Option<&str>,
    ) -> Result<ListPage, ConnectorError> {
        let offset = parse_offset(continuation)?;
        let dir = resolve_under(&self.root, &request.location)?;
        if !dir.is_dir() {
            return Err(ConnectorError::not_found(
                "NO_SUCH_DIRECTORY",
                format!("directory '{}' does not exist", request.location),
            ));
        }

        let walker = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(if request.recursive { usize::MAX } else { 1 })
            .sort_by_file_name();

        let mut entries = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| match e.io_error() {
                Some(io) => ConnectorError::from_io("LIST_FAILED", io),
                None => ConnectorError::internal("LIST_FAILED", e.to_string()),
            })?;
            if entry.file_type().is_file() {
                entries.push(entry);
            }
        }

        let (page, continuation) = page_of(entries, offset, request.page_size);
        let mut items = Vec::with_capacity(page.len());
        for entry in page {
            let meta = entry
                .metadata()
                .map_err(|e| ConnectorError::internal("STAT_FAILED", e.to_string()))?;
            let Some(rel) = relative_slash_path(&dir, entry.path()) else {
                continue;
            };
            let full = remote_join(&request.location, &rel);
            items.push(FileMeta::new(rel, full, meta.len(), modified_secs(&meta)?).into());
        }
        Ok(ListPage {
            items,
            continuation,
        })
    }

    fn stat(&self, item: &SourceItem) -> Result<SourceItem, ConnectorError> {
        let file = self.file_of(item)?;
        let path = resolve_under(&self.root, &file.full_file_path)?;
        let meta =
            std::fs::metadata(&path).map_err(|e| ConnectorError::from_io("STAT_FAILED", &e))?;
        let mut fresh = file.clone();
        fresh.file_size = meta.len();
        fresh.modified_ts = modified_secs(&meta)?;
        Ok(fresh.into())
    }

    fn open(&self, item: &SourceItem) -> Result<Box<dyn Read + Send>, ConnectorError> {
        let file = self.file_of(item)?;
        let path = resolve_under(&self.root, &file.full_file_path)?;
        let handle = File::open(&path).map_err(|e| ConnectorError::from_io("OPEN_FAILED", &e))?;
        Ok(Box::new(handle))
    }
}

/// Writes files under `root/<container>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalFileTarget {
    root: PathBuf,
}

impl LocalFileTarget {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TargetConnector for LocalFileTarget {
    fn open_writer(
        &self,
        location: &TargetLocation,
    ) -> Result<Box<dyn TargetWriter>, ConnectorError> {
        if location.key.is_empty() {
            return Err(ConnectorError::config("EMPTY_KEY", "target file name is empty"));
        }
        let dir = resolve_under(&self.root, &location.container)?;
        let path = resolve_under(&dir, &location.key)?;
        Ok(Box::new(StagedFileWriter::create(path)?))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use serde_json::Map;

    fn request(location: &str, page_size: usize) -> ListRequest {
        ListRequest {
            location: location.into(),
            prefix: None,
            recursive: true,
            page_size,
        }
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("outbound");
        std::fs::create_dir_all(out.join("daily")).unwrap();
        std::fs::write(out.join("b.csv"), b"bb").unwrap();
        std::fs::write(out.join("a.csv"), b"a").unwrap();
        std::fs::write(out.join("daily/c.csv"), b"ccc").unwrap();
        dir
    }

    #[test]
    fn lists_files_with_remote_paths() {
        let dir = fixture();
        let source = LocalFileSource::new(dir.path());
        let page = source.list_page(&request("/outbound", 100), None).unwrap();
        let names: Vec<_> = page.items.iter().map(SourceItem::identity).collect();
        assert_eq!(names, vec!["/outbound/a.csv", "/outbound/b.csv", "/outbound/daily/c.csv"]);
        let SourceItem::File(c) = &page.items[2] else { panic!("expected file") };
        assert_eq!(c.file_path, "daily/c.csv");
        assert_eq!(c.file_name, "c.csv");
        assert_eq!(c.file_size, 3);
        assert!(page.continuation.is_none());
    }

    #[test]
    fn non_recursive_listing_stays_at_top() {
        let dir = fixture();
        let source = LocalFileSource::new(dir.path());
        let mut req = request("/outbound", 100);
        req.recursive = false;
        assert_eq!(source.list_page(&req, None).unwrap().items.len(), 2);
    }

    #[test]
    fn paginates() {
        let dir = fixture();
        let source = LocalFileSource::new(dir.path());
        let first = source.list_page(&request("/outbound", 2), None).unwrap();
        assert_eq!(first.items.len(), 2);
        let token = first.continuation.unwrap();
        let second = source.list_page(&request("/outbound", 2), Some(&token)).unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.continuation.is_none());
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalFileSource::new(dir.path())
            .list_page(&request("/nope", 10), None)
            .unwrap_err();
        assert_eq!(err.code, "NO_SUCH_DIRECTORY");
    }

    #[test]
    fn stat_and_open() {
        let dir = fixture();
        let source = LocalFileSource::new(dir.path());
        let item: SourceItem = FileMeta::new("a.csv", "/outbound/a.csv", 0, 0).into();
        assert_eq!(source.stat(&item).unwrap().size(), 1);
        let mut body = String::new();
        source.open(&item).unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "a");
    }

    #[test]
    fn target_writes_under_container() {
        let dir = tempfile::tempdir().unwrap();
        let target = LocalFileTarget::new(dir.path());
        let location = TargetLocation {
            container: "/inbound".into(),
            key: "x.csv".into(),
            options: Map::new(),
        };
        let mut writer = target.open_writer(&location).unwrap();
        writer.write_all(b"x").unwrap();
        writer.commit().unwrap();
        assert_eq!(std::fs::read(dir.path().join("inbound/x.csv")).unwrap(), b"x");
    }
}
