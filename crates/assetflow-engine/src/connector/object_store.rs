//! Object store over a local directory: each bucket is a directory under the
//! root and keys are `/`-separated paths inside it.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use assetflow_types::error::ConnectorError;
use assetflow_types::item::{ItemKind, ObjectMeta, SourceItem};
use walkdir::WalkDir;

use super::{
    modified_secs, page_of, parse_offset, resolve_under, ListPage, ListRequest, SourceConnector,
    StagedFileWriter, TargetConnector, TargetLocation, TargetWriter,
};

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, ConnectorError> {
        if bucket.is_empty() || bucket.contains('/') {
            return Err(ConnectorError::config(
                "INVALID_BUCKET",
                format!("invalid bucket name '{bucket}'"),
            ));
        }
        resolve_under(&self.root, bucket)
    }

    fn object_of<'a>(&self, item: &'a SourceItem) -> Result<&'a ObjectMeta, ConnectorError> {
        match item {
            SourceItem::Object(o) => Ok(o),
            SourceItem::File(_) => Err(ConnectorError::config(
                "WRONG_ITEM_KIND",
                format!("object store cannot read file item '{}'", item.identity()),
            )),
        }
    }

    fn object_path(&self, object: &ObjectMeta) -> Result<PathBuf, ConnectorError> {
        resolve_under(&self.bucket_dir(&object.bucket_name)?, &object.key)
    }
}

impl SourceConnector for LocalObjectStore {
    fn item_kind(&self) -> ItemKind {
        ItemKind::Object
    }

    fn list_page(
        &self,
        request: &ListRequest,
        continuation: Option<&str>,
    ) -> Result<ListPage, ConnectorError> {
        let offset = parse_offset(continuation)?;
        let bucket = &request.location;
        let dir = self.bucket_dir(bucket)?;
        if !dir.is_dir() {
            return Err(ConnectorError::not_found(
                "NO_SUCH_BUCKET",
                format!("bucket '{bucket}' does not exist"),
            ));
        }
        let prefix = request.prefix.as_deref().unwrap_or_default();

        let mut keys = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| match e.io_error() {
                Some(io) => ConnectorError::from_io("LIST_FAILED", io),
                None => ConnectorError::internal("LIST_FAILED", e.to_string()),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&dir) else {
                continue;
            };
            let key: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let key = key.join("/");
            if !key.starts_with(prefix) {
                continue;
            }
            // Without recursion only keys directly under the prefix count.
            if !request.recursive && key[prefix.len()..].trim_start_matches('/').contains('/') {
                continue;
            }
            keys.push((key, entry));
        }
        keys.sort_by(|a, b| a.0.cmp(&b.0));

        let (page, continuation) = page_of(keys, offset, request.page_size);
        let mut items = Vec::with_capacity(page.len());
        for (key, entry) in page {
            let meta = entry
                .metadata()
                .map_err(|e| ConnectorError::internal("STAT_FAILED", e.to_string()))?;
            items.push(
                ObjectMeta::new(
                    bucket.as_str(),
                    key,
                    request.prefix.clone(),
                    meta.len(),
                    modified_secs(&meta)?,
                )
                .into(),
            );
        }
        Ok(ListPage {
            items,
            continuation,
        })
    }

    fn stat(&self, item: &SourceItem) -> Result<SourceItem, ConnectorError> {
        let object = self.object_of(item)?;
        let meta = std::fs::metadata(self.object_path(object)?)
            .map_err(|e| ConnectorError::from_io("STAT_FAILED", &e))?;
        let mut fresh = object.clone();
        fresh.size = meta.len();
        fresh.modified_ts = modified_secs(&meta)?;
        Ok(fresh.into())
    }

    fn open(&self, item: &SourceItem) -> Result<Box<dyn Read + Send>, ConnectorError> {
        let object = self.object_of(item)?;
        let handle = File::open(self.object_path(object)?)
            .map_err(|e| ConnectorError::from_io("OPEN_FAILED", &e))?;
        Ok(Box::new(handle))
    }
}

impl TargetConnector for LocalObjectStore {
    fn open_writer(
        &self,
        location: &TargetLocation,
    ) -> Result<Box<dyn TargetWriter>, ConnectorError> {
        if location.key.trim_matches('/').is_empty() {
            return Err(ConnectorError::config("EMPTY_KEY", "target key is empty"));
        }
        let path = resolve_under(&self.bucket_dir(&location.container)?, &location.key)?;
        Ok(Box::new(StagedFileWriter::create(path)?))
    }
}
