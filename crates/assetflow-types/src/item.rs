//! Source item model.
//!
//! A [`SourceItem`] describes one discovered unit of transfer. Each variant
//! carries a fixed attribute set; attribute names are not shared across
//! variants, so asking a file for `object_name` (or an object for
//! `file_name`) yields `None` rather than a blank value.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attributes exposed by [`FileMeta`] to templates.
pub const FILE_ATTRIBUTES: &[&str] = &[
    "file_name",
    "path",
    "full_file_path",
    "file_size",
    "modified_ts",
    "name",
    "ext",
];

/// Attributes exposed by [`ObjectMeta`] to templates.
pub const OBJECT_ATTRIBUTES: &[&str] = &[
    "object_name",
    "key",
    "bucket_name",
    "size",
    "path",
    "object_path",
    "modified_ts",
];

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// Variant tag of a [`SourceItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Remote-file style item (SFTP, local directory).
    File,
    /// Object-store style item (S3).
    Object,
}

impl ItemKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Object => "object",
        }
    }

    /// Attribute names defined for this kind.
    #[must_use]
    pub fn attributes(self) -> &'static [&'static str] {
        match self {
            Self::File => FILE_ATTRIBUTES,
            Self::Object => OBJECT_ATTRIBUTES,
        }
    }

    /// Whether `name` is an attribute of this kind.
    #[must_use]
    pub fn defines(self, name: &str) -> bool {
        self.attributes().contains(&name)
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Path helpers ('/'-separated remote paths, independent of the host OS)
// ---------------------------------------------------------------------------

fn basename(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, tail)| tail)
}

fn dirname(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(head, _)| head)
}

/// Split `file_name` into (stem, extension-with-dot). Leading dots do not
/// start an extension.
fn split_ext(file_name: &str) -> (&str, &str) {
    let trimmed = file_name.trim_start_matches('.');
    let offset = file_name.len() - trimmed.len();
    match trimmed.rfind('.') {
        Some(idx) => file_name.split_at(offset + idx),
        None => (file_name, ""),
    }
}

// ---------------------------------------------------------------------------
// FileMeta
// ---------------------------------------------------------------------------

/// Metadata of a file on a remote file system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileMeta {
    /// Base name including extension.
    pub file_name: String,
    /// Path relative to the listing root, including the file name.
    pub file_path: String,
    /// Absolute path on the remote system.
    pub full_file_path: String,
    pub file_size: u64,
    /// Modification time, epoch seconds.
    pub modified_ts: i64,
}

impl FileMeta {
    /// Build from the relative and absolute paths; `file_name` is derived.
    #[must_use]
    pub fn new(
        file_path: impl Into<String>,
        full_file_path: impl Into<String>,
        file_size: u64,
        modified_ts: i64,
    ) -> Self {
        let file_path = file_path.into();
        Self {
            file_name: basename(&file_path).to_string(),
            file_path,
            full_file_path: full_file_path.into(),
            file_size,
            modified_ts,
        }
    }

    /// Directory portion of [`FileMeta::file_path`].
    #[must_use]
    pub fn path(&self) -> &str {
        dirname(&self.file_path)
    }

    /// File name without extension.
    #[must_use]
    pub fn name(&self) -> &str {
        split_ext(&self.file_name).0
    }

    /// Extension including the leading dot, or empty.
    #[must_use]
    pub fn ext(&self) -> &str {
        split_ext(&self.file_name).1
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        let value = match name {
            "file_name" => Value::from(self.file_name.as_str()),
            "path" => Value::from(self.path()),
            "full_file_path" => Value::from(self.full_file_path.as_str()),
            "file_size" => Value::from(self.file_size),
            "modified_ts" => Value::from(self.modified_ts),
            "name" => Value::from(self.name()),
            "ext" => Value::from(self.ext()),
            _ => return None,
        };
        Some(value)
    }
}

// ---------------------------------------------------------------------------
// ObjectMeta
// ---------------------------------------------------------------------------

/// Metadata of an object in a bucket-addressed store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub bucket_name: String,
    pub key: String,
    /// Listing prefix the object was discovered under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub size: u64,
    /// Modification time, epoch seconds.
    pub modified_ts: i64,
}

impl ObjectMeta {
    #[must_use]
    pub fn new(
        bucket_name: impl Into<String>,
        key: impl Into<String>,
        prefix: Option<String>,
        size: u64,
        modified_ts: i64,
    ) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            key: key.into(),
            prefix,
            size,
            modified_ts,
        }
    }

    /// Last segment of the key.
    #[must_use]
    pub fn object_name(&self) -> &str {
        basename(&self.key)
    }

    /// Directory portion of the key.
    #[must_use]
    pub fn path(&self) -> &str {
        dirname(&self.key)
    }

    /// Key relative to the listing prefix, or the key itself without one.
    #[must_use]
    pub fn object_path(&self) -> &str {
        match self.prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() && self.key.starts_with(prefix) => {
                self.key[prefix.len()..].trim_start_matches('/')
            }
            _ => &self.key,
        }
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        let value = match name {
            "object_name" => Value::from(self.object_name()),
            "key" => Value::from(self.key.as_str()),
            "bucket_name" => Value::from(self.bucket_name.as_str()),
            "size" => Value::from(self.size),
            "path" => Value::from(self.path()),
            "object_path" => Value::from(self.object_path()),
            "modified_ts" => Value::from(self.modified_ts),
            _ => return None,
        };
        Some(value)
    }
}

// ---------------------------------------------------------------------------
// SourceItem
// ---------------------------------------------------------------------------

/// One discovered unit of transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceItem {
    File(FileMeta),
    Object(ObjectMeta),
}

impl SourceItem {
    #[must_use]
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::File(_) => ItemKind::File,
            Self::Object(_) => ItemKind::Object,
        }
    }

    /// Stable identity used for cursors, run keys and failure reports.
    #[must_use]
    pub fn identity(&self) -> String {
        match self {
            Self::File(f) => f.full_file_path.clone(),
            Self::Object(o) => format!("{}/{}", o.bucket_name, o.key),
        }
    }

    /// Tie-break key for items sharing a timestamp.
    #[must_use]
    pub fn secondary_key(&self) -> &str {
        match self {
            Self::File(f) => &f.file_path,
            Self::Object(o) => &o.key,
        }
    }

    /// Base name of the item (file name or object name).
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self {
            Self::File(f) => &f.file_name,
            Self::Object(o) => o.object_name(),
        }
    }

    /// String the discovery `pattern` is matched against.
    #[must_use]
    pub fn pattern_subject(&self) -> &str {
        match self {
            Self::File(f) => &f.file_name,
            Self::Object(o) => o.object_path(),
        }
    }

    #[must_use]
    pub fn modified_ts(&self) -> i64 {
        match self {
            Self::File(f) => f.modified_ts,
            Self::Object(o) => o.modified_ts,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::File(f) => f.file_size,
            Self::Object(o) => o.size,
        }
    }

    /// Look up a template attribute. Returns `None` for names the variant
    /// does not define, including names that belong to the other variant.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match self {
            Self::File(f) => f.attribute(name),
            Self::Object(o) => o.attribute(name),
        }
    }

    /// Discovery order: modification time, then secondary key ascending.
    #[must_use]
    pub fn discovery_cmp(&self, other: &Self) -> Ordering {
        self.modified_ts()
            .cmp(&other.modified_ts())
            .then_with(|| self.secondary_key().cmp(other.secondary_key()))
    }
}

impl From<FileMeta> for SourceItem {
    fn from(value: FileMeta) -> Self {
        Self::File(value)
    }
}

impl From<ObjectMeta> for SourceItem {
    fn from(value: ObjectMeta) -> Self {
        Self::Object(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> SourceItem {
        FileMeta::new("in/daily/report.2024.csv", "/data/in/daily/report.2024.csv", 512, 100).into()
    }

    fn object() -> SourceItem {
        ObjectMeta::new("raw", "landing/2024/orders.json", Some("landing".into()), 2048, 90).into()
    }

    #[test]
    fn file_derived_attributes() {
        let item = file();
        assert_eq!(item.attribute("file_name"), Some(Value::from("report.2024.csv")));
        assert_eq!(item.attribute("path"), Some(Value::from("in/daily")));
        assert_eq!(item.attribute("name"), Some(Value::from("report.2024")));
        assert_eq!(item.attribute("ext"), Some(Value::from(".csv")));
        assert_eq!(item.attribute("file_size"), Some(Value::from(512)));
    }

    #[test]
    fn object_derived_attributes() {
        let item = object();
        assert_eq!(item.attribute("object_name"), Some(Value::from("orders.json")));
        assert_eq!(item.attribute("path"), Some(Value::from("landing/2024")));
        assert_eq!(item.attribute("object_path"), Some(Value::from("2024/orders.json")));
        assert_eq!(item.identity(), "raw/landing/2024/orders.json");
    }

    #[test]
    fn attributes_do_not_cross_variants() {
        assert!(object().attribute("file_name").is_none());
        assert!(object().attribute("file_size").is_none());
        assert!(file().attribute("object_name").is_none());
        assert!(file().attribute("bucket_name").is_none());
    }

    #[test]
    fn every_declared_attribute_resolves() {
        for name in FILE_ATTRIBUTES {
            assert!(file().attribute(name).is_some(), "file attribute {name}");
        }
        for name in OBJECT_ATTRIBUTES {
            assert!(object().attribute(name).is_some(), "object attribute {name}");
        }
    }

    #[test]
    fn hidden_files_have_no_extension() {
        let meta = FileMeta::new(".env", "/x/.env", 1, 1);
        assert_eq!(meta.name(), ".env");
        assert_eq!(meta.ext(), "");
    }

    #[test]
    fn discovery_order_breaks_ties_by_secondary_key() {
        let a: SourceItem = FileMeta::new("a.csv", "/a.csv", 1, 100).into();
        let b: SourceItem = FileMeta::new("b.csv", "/b.csv", 1, 100).into();
        let c: SourceItem = FileMeta::new("c.csv", "/c.csv", 1, 90).into();
        let mut items = vec![b.clone(), a.clone(), c.clone()];
        items.sort_by(SourceItem::discovery_cmp);
        assert_eq!(items, vec![c, a, b]);
    }

    #[test]
    fn serde_tagged_by_kind() {
        let json = serde_json::to_value(object()).unwrap();
        assert_eq!(json["kind"], "object");
        let back: SourceItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, object());
    }
}
