//! Resolves connection specs to connector instances.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use assetflow_types::error::ConnectorError;

use super::{
    LocalFileSource, LocalFileTarget, LocalObjectStore, RowSource, SourceConnector, SqliteRowSource,
    TargetConnector,
};
use crate::config::types::{ConnectionKind, ConnectionSpec};

/// Connection key pointing the built-in backends at a local directory.
pub const ROOT_DIR_KEY: &str = "root_dir";
/// Connection key naming the database file of a `sqlite` connection.
pub const DATABASE_PATH_KEY: &str = "database_path";

pub type SourceFactory =
    Arc<dyn Fn(&ConnectionSpec) -> Result<Arc<dyn SourceConnector>, ConnectorError> + Send + Sync>;
pub type TargetFactory =
    Arc<dyn Fn(&ConnectionSpec) -> Result<Arc<dyn TargetConnector>, ConnectorError> + Send + Sync>;
pub type RowFactory =
    Arc<dyn Fn(&ConnectionSpec) -> Result<Arc<dyn RowSource>, ConnectorError> + Send + Sync>;

/// Factories keyed by connection type.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    sources: HashMap<ConnectionKind, SourceFactory>,
    targets: HashMap<ConnectionKind, TargetFactory>,
    rows: HashMap<ConnectionKind, RowFactory>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut sources: Vec<_> = self.sources.keys().map(|k| k.as_str()).collect();
        let mut targets: Vec<_> = self.targets.keys().map(|k| k.as_str()).collect();
        let mut rows: Vec<_> = self.rows.keys().map(|k| k.as_str()).collect();
        sources.sort_unstable();
        targets.sort_unstable();
        rows.sort_unstable();
        f.debug_struct("ConnectorRegistry")
            .field("sources", &sources)
            .field("targets", &targets)
            .field("rows", &rows)
            .finish()
    }
}

fn root_dir(spec: &ConnectionSpec) -> Result<PathBuf, ConnectorError> {
    spec.get_str(ROOT_DIR_KEY).map(PathBuf::from).ok_or_else(|| {
        ConnectorError::config(
            "NO_BUILTIN_CLIENT",
            format!(
                "connection type '{}' needs '{ROOT_DIR_KEY}' for the built-in backend, \
                 or a registered connector",
                spec.kind
            ),
        )
    })
}

impl ConnectorRegistry {
    /// Registry with no factories.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the local-directory backends for `sftp`, `local` and
    /// `s3` connections that set `root_dir`, and the row source for
    /// `sqlite` connections.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for kind in [ConnectionKind::Sftp, ConnectionKind::Local] {
            registry.register_source(kind, |spec| {
                Ok(Arc::new(LocalFileSource::new(root_dir(spec)?)) as Arc<dyn SourceConnector>)
            });
            registry.register_target(kind, |spec| {
                Ok(Arc::new(LocalFileTarget::new(root_dir(spec)?)) as Arc<dyn TargetConnector>)
            });
        }
        registry.register_source(ConnectionKind::S3, |spec| {
            Ok(Arc::new(LocalObjectStore::new(root_dir(spec)?)) as Arc<dyn SourceConnector>)
        });
        registry.register_target(ConnectionKind::S3, |spec| {
            Ok(Arc::new(LocalObjectStore::new(root_dir(spec)?)) as Arc<dyn TargetConnector>)
        });
        registry.register_rows(ConnectionKind::Sqlite, |spec| {
            let path = spec.get_str(DATABASE_PATH_KEY).ok_or_else(|| {
                ConnectorError::config(
                    "NO_DATABASE_PATH",
                    format!("sqlite connections need '{DATABASE_PATH_KEY}'"),
                )
            })?;
            Ok(Arc::new(SqliteRowSource::new(path)) as Arc<dyn RowSource>)
        });
        registry
    }

    /// Install (or replace) the source factory for `kind`.
    pub fn register_source<F>(&mut self, kind: ConnectionKind, factory: F)
    where
        F: Fn(&ConnectionSpec) -> Result<Arc<dyn SourceConnector>, ConnectorError>
            + Send
            + Sync
            + 'static,
    {
        self.sources.insert(kind, Arc::new(factory));
    }

    /// Install (or replace) the target factory for `kind`.
    pub fn register_target<F>(&mut self, kind: ConnectionKind, factory: F)
    where
        F: Fn(&ConnectionSpec) -> Result<Arc<dyn TargetConnector>, ConnectorError>
            + Send
            + Sync
            + 'static,
    {
        self.targets.insert(kind, Arc::new(factory));
    }

    /// Install (or replace) the row source factory for `kind`.
    pub fn register_rows<F>(&mut self, kind: ConnectionKind, factory: F)
    where
        F: Fn(&ConnectionSpec) -> Result<Arc<dyn RowSource>, ConnectorError>
            + Send
            + Sync
            + 'static,
    {
        self.rows.insert(kind, Arc::new(factory));
    }

    /// Build the row source a database sensor polls.
    ///
    /// # Errors
    ///
    /// Returns a config [`ConnectorError`] when no factory handles the
    /// connection's type, or the factory's own error.
    pub fn rows(&self, spec: &ConnectionSpec) -> Result<Arc<dyn RowSource>, ConnectorError> {
        let factory = self.rows.get(&spec.kind).ok_or_else(|| {
            ConnectorError::config(
                "NO_ROW_SOURCE",
                format!("no row source registered for type '{}'", spec.kind),
            )
        })?;
        factory(spec)
    }

    /// Build the source connector for a connection.
    ///
    /// # Errors
    ///
    /// Returns a config [`ConnectorError`] when no factory handles the
    /// connection's type, or the factory's own error.
    pub fn source(
        &self,
        spec: &ConnectionSpec,
    ) -> Result<Arc<dyn SourceConnector>, ConnectorError> {
        let factory = self.sources.get(&spec.kind).ok_or_else(|| {
            ConnectorError::config(
                "NO_SOURCE_CONNECTOR",
                format!("no source connector registered for type '{}'", spec.kind),
            )
        })?;
        factory(spec)
    }

    /// Build the target connector for a connection.
    ///
    /// # Errors
    ///
    /// Returns a config [`ConnectorError`] when no factory handles the
    /// connection's type, or the factory's own error.
    pub fn target(
        &self,
        spec: &ConnectionSpec,
    ) -> Result<Arc<dyn TargetConnector>, ConnectorError> {
        let factory = self.targets.get(&spec.kind).ok_or_else(|| {
            ConnectorError::config(
                "NO_TARGET_CONNECTOR",
                format!("no target connector registered for type '{}'", spec.kind),
            )
        })?;
        factory(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetflow_types::item::ItemKind;
    use serde_json::{json, Map, Value};

    fn spec(kind: ConnectionKind, config: Value) -> ConnectionSpec {
        let Value::Object(config) = config else {
            return ConnectionSpec {
                kind,
                config: Map::new(),
            };
        };
        ConnectionSpec { kind, config }
    }

    #[test]
    fn builtins_resolve_by_kind() {
        let registry = ConnectorRegistry::with_builtins();
        let sftp = registry
            .source(&spec(ConnectionKind::Sftp, json!({"root_dir": "/tmp"})))
            .unwrap();
        assert_eq!(sftp.item_kind(), ItemKind::File);
        let s3 = registry
            .source(&spec(ConnectionKind::S3, json!({"root_dir": "/tmp"})))
            .unwrap();
        assert_eq!(s3.item_kind(), ItemKind::Object);
    }

    #[test]
    fn builtins_need_root_dir() {
        let registry = ConnectorRegistry::with_builtins();
        let err = registry
            .source(&spec(ConnectionKind::Sftp, json!({"host": "sftp.example.com"})))
            .err()
            .unwrap();
        assert_eq!(err.code, "NO_BUILTIN_CLIENT");
    }

    #[test]
    fn databases_have_no_builtin() {
        let registry = ConnectorRegistry::with_builtins();
        let err = registry
            .target(&spec(ConnectionKind::Snowflake, json!({})))
            .err()
            .unwrap();
        assert_eq!(err.code, "NO_TARGET_CONNECTOR");
    }

    #[test]
    fn sqlite_row_source_needs_a_path() {
        let registry = ConnectorRegistry::with_builtins();
        assert!(registry
            .rows(&spec(ConnectionKind::Sqlite, json!({"database_path": "/tmp/app.db"})))
            .is_ok());
        let err = registry
            .rows(&spec(ConnectionKind::Sqlite, json!({})))
            .err()
            .unwrap();
        assert_eq!(err.code, "NO_DATABASE_PATH");
        let err = registry
            .rows(&spec(ConnectionKind::Postgres, json!({})))
            .err()
            .unwrap();
        assert_eq!(err.code, "NO_ROW_SOURCE");
    }

    #[test]
    fn custom_factories_replace_builtins() {
        let mut registry = ConnectorRegistry::with_builtins();
        registry.register_source(ConnectionKind::Sftp, |_| {
            Ok(Arc::new(LocalObjectStore::new("/srv")) as Arc<dyn SourceConnector>)
        });
        let source = registry
            .source(&spec(ConnectionKind::Sftp, json!({})))
            .unwrap();
        assert_eq!(source.item_kind(), ItemKind::Object);
        assert!(format!("{registry:?}").contains("sftp"));
    }
}
