//! Serde model of a pipeline definition file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use assetflow_types::cursor::CursorStrategy;
use assetflow_types::item::ItemKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::template::OperationKind;

/// Environment variable selecting the active config layer.
pub const ENVIRONMENT_VAR: &str = "ASSETFLOW_ENV";
/// Layer used when no environment is selected.
pub const DEFAULT_ENVIRONMENT: &str = "dev";
/// Layer shared by every environment.
pub const COMMON_LAYER: &str = "common";

const MASK: &str = "******";
const SENSITIVE_KEYS: &[&str] = &["password", "secret", "token", "private_key", "passphrase"];

/// Top-level pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub pipeline: String,
    #[serde(default)]
    pub assets: Vec<AssetDef>,
    #[serde(default)]
    pub jobs: Vec<JobDef>,
    #[serde(default)]
    pub sensors: Vec<SensorDef>,
    #[serde(default)]
    pub schedules: Vec<ScheduleDef>,
    /// `{common: {<name>: {...}}, <env>: {...}}`
    #[serde(default)]
    pub connections: BTreeMap<String, Value>,
    /// `{common: {...}, <env>: {...}}`
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// External system a connection points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    S3,
    Sftp,
    Local,
    SqlServer,
    Snowflake,
    Postgres,
    Sqlite,
}

impl ConnectionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Sftp => "sftp",
            Self::Local => "local",
            Self::SqlServer => "sqlserver",
            Self::Snowflake => "snowflake",
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// Which whitelist applies to configs using this connection.
    #[must_use]
    pub fn operation_kind(self) -> OperationKind {
        match self {
            Self::S3 => OperationKind::ObjectStore,
            Self::Sftp | Self::Local => OperationKind::RemoteFile,
            Self::SqlServer | Self::Snowflake | Self::Postgres | Self::Sqlite => {
                OperationKind::Database
            }
        }
    }

    /// Whether sensors on this connection poll a cursor column instead of
    /// listing items.
    #[must_use]
    pub fn is_database(self) -> bool {
        self.item_kind().is_none()
    }

    /// Item variant listed from this connection; `None` for databases.
    #[must_use]
    pub fn item_kind(self) -> Option<ItemKind> {
        match self {
            Self::S3 => Some(ItemKind::Object),
            Self::Sftp | Self::Local => Some(ItemKind::File),
            Self::SqlServer | Self::Snowflake | Self::Postgres | Self::Sqlite => None,
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved connection after environment layering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    /// Remaining keys (host, credentials, `root_dir`, ...).
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl ConnectionSpec {
    /// String config value.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Config with credential-like values replaced by `******`.
    #[must_use]
    pub fn masked(&self) -> Map<String, Value> {
        match mask_sensitive(&Value::Object(self.config.clone())) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

fn is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| lower.contains(s))
}

/// Replace values under credential-like keys with `******`, recursively.
#[must_use]
pub fn mask_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = if is_sensitive(k) && !v.is_object() {
                        Value::String(MASK.to_string())
                    } else {
                        mask_sensitive(v)
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_sensitive).collect()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Assets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub concurrency_key: Option<String>,
    /// Overrides `resources.max_workers` for this asset.
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub partitions: Option<PartitionsConfig>,
    /// Re-stat items before transfer and skip ones still being written.
    #[serde(default)]
    pub check_is_modifying: bool,
    pub source: EndpointDef,
    pub target: EndpointDef,
}

/// `source:` / `target:` / sensor block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDef {
    pub connection: String,
    #[serde(default)]
    pub configs: Map<String, Value>,
}

/// Partitioning of an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionsConfig {
    Hourly {
        start_date: String,
        #[serde(default)]
        end_date: Option<String>,
        #[serde(default)]
        fmt: Option<String>,
    },
    Daily {
        start_date: String,
        #[serde(default)]
        end_date: Option<String>,
        #[serde(default)]
        fmt: Option<String>,
    },
    Weekly {
        start_date: String,
        #[serde(default)]
        end_date: Option<String>,
        #[serde(default)]
        fmt: Option<String>,
    },
    Monthly {
        start_date: String,
        #[serde(default)]
        end_date: Option<String>,
        #[serde(default)]
        fmt: Option<String>,
    },
    Cron {
        cron_schedule: String,
        start_date: String,
        #[serde(default)]
        end_date: Option<String>,
        #[serde(default)]
        fmt: Option<String>,
    },
    Static {
        values: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Jobs, sensors, schedules
// ---------------------------------------------------------------------------

/// Asset selection of a job: `"*"`, `"group:<name>"`, a single name, or a
/// list of names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selection {
    One(String),
    Many(Vec<String>),
}

impl Selection {
    #[must_use]
    pub fn entries(&self) -> Vec<&str> {
        match self {
            Self::One(s) => vec![s.as_str()],
            Self::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub selection: Selection,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorDef {
    pub name: String,
    pub job: String,
    pub connection: String,
    #[serde(default = "default_min_interval")]
    pub minimum_interval_seconds: u64,
    #[serde(default)]
    pub cursor: CursorStrategy,
    /// Partition the cursor is kept under, and passed to triggered runs.
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub configs: Map<String, Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_min_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleDef {
    pub name: String,
    pub job: String,
    pub cron: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// State and resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    #[serde(default)]
    pub path: Option<String>,
}

impl StateConfig {
    /// Configured path, or `~/.assetflow/state.db`.
    #[must_use]
    pub fn resolve_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return PathBuf::from(path);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".assetflow").join("state.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// Budget per concurrency key.
    #[serde(default)]
    pub pools: BTreeMap<String, usize>,
    #[serde(default = "default_pool_budget")]
    pub default_pool_budget: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_stream_threshold")]
    pub stream_threshold: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: String,
    #[serde(default = "default_progress_step")]
    pub progress_step_percent: u8,
    #[serde(default = "default_modifying_grace")]
    pub modifying_grace_seconds: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Consecutive transient sensor failures tolerated; 0 retries forever.
    #[serde(default)]
    pub max_retries: u32,
}

fn default_pool_budget() -> usize {
    5
}
fn default_max_workers() -> usize {
    5
}
fn default_stream_threshold() -> String {
    "8mb".to_string()
}
fn default_chunk_size() -> String {
    "1mb".to_string()
}
fn default_progress_step() -> u8 {
    10
}
fn default_modifying_grace() -> u64 {
    60
}
fn default_page_size() -> usize {
    1000
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            pools: BTreeMap::new(),
            default_pool_budget: default_pool_budget(),
            max_workers: default_max_workers(),
            stream_threshold: default_stream_threshold(),
            chunk_size: default_chunk_size(),
            progress_step_percent: default_progress_step(),
            modifying_grace_seconds: default_modifying_grace(),
            page_size: default_page_size(),
            max_retries: 0,
        }
    }
}

/// Parse `512`, `64kb`, `8mb`, `1gb` (1024-based, case-insensitive).
///
/// # Errors
///
/// Returns a description of the problem if the value is not a byte size.
pub fn parse_byte_size(raw: &str) -> Result<u64, String> {
    let s = raw.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(n) = s.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('b') {
        (n, 1)
    } else {
        (s.as_str(), 1)
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid byte size '{raw}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("byte size '{raw}' is too large"))
}
