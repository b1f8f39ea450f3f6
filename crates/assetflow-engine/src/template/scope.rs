//! Exposes a [`TemplateContext`] to the template engine as lazily resolved
//! objects.
//!
//! Every lookup that misses is written to a per-render [`MissLog`], so a
//! failed render can name the exact token (`source.item.file_name`) and the
//! reason, and a render that quietly consumed an undefined value still
//! fails.

use std::sync::{Arc, Mutex};

use assetflow_types::item::SourceItem;
use chrono::{DateTime, Utc};
use minijinja::value::{Enumerator, Object, ObjectRepr};
use minijinja::{Error, ErrorKind, State, Value};

use super::helpers::{self, HelperError};
use crate::context::{
    TemplateContext, ROOT_ENV, ROOT_HELPERS, ROOT_PARTITION_END, ROOT_PARTITION_KEY,
    ROOT_PARTITION_START, ROOT_RUN_TAGS, ROOT_SOURCE, ROOT_VARS,
};

/// Engine globals that are looked up in the context before the engine's
/// own table; their misses are not errors.
const ENGINE_GLOBALS: &[&str] = &["range", "dict", "debug", "namespace"];

const HELPER_NAMESPACES: &[&str] = &["date", "cron"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Miss {
    pub(super) token: String,
    pub(super) reason: String,
}

/// First unresolved lookup of one render.
#[derive(Debug, Default)]
pub(super) struct MissLog(Mutex<Option<Miss>>);

impl MissLog {
    fn record(&self, token: String, reason: String) {
        if let Ok(mut slot) = self.0.lock() {
            slot.get_or_insert(Miss { token, reason });
        }
    }

    pub(super) fn take(&self) -> Option<Miss> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Root object handed to the engine for one render.
#[derive(Debug)]
pub(super) struct Scope {
    root: Value,
    misses: Arc<MissLog>,
}

impl Scope {
    pub(super) fn new(ctx: &TemplateContext) -> Self {
        let misses = Arc::new(MissLog::default());
        let root = Value::from_object(RootNode {
            ctx: ctx.clone(),
            misses: Arc::clone(&misses),
        });
        Self { root, misses }
    }

    pub(super) fn value(&self) -> &Value {
        &self.root
    }

    pub(super) fn take_miss(&self) -> Option<Miss> {
        self.misses.take()
    }
}

fn join(parent: &str, key: &str) -> String {
    format!("{parent}.{key}")
}

fn wrap(path: String, value: &serde_json::Value, misses: &Arc<MissLog>) -> Value {
    match value {
        serde_json::Value::Object(_) => Value::from_object(DataNode {
            path,
            value: value.clone(),
            misses: Arc::clone(misses),
        }),
        other => Value::from_serialize(other),
    }
}

// ---------------------------------------------------------------------------
// Data roots
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RootNode {
    ctx: TemplateContext,
    misses: Arc<MissLog>,
}

impl RootNode {
    fn missing_reason(&self, name: &str) -> String {
        match name {
            ROOT_SOURCE => "no source item in this context".to_string(),
            ROOT_PARTITION_KEY => "asset is not partitioned".to_string(),
            ROOT_PARTITION_START | ROOT_PARTITION_END => {
                if self.ctx.partition().is_some() {
                    "partition has no time window".to_string()
                } else {
                    "asset is not partitioned".to_string()
                }
            }
            _ => "undefined variable".to_string(),
        }
    }
}

impl Object for RootNode {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Map
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        // The helper namespace resolves before any data root.
        if name == ROOT_HELPERS {
            return Some(Value::from_object(HelperRoot {
                now: self.ctx.now(),
            }));
        }
        if name == ROOT_SOURCE {
            if let Some(item) = self.ctx.item() {
                return Some(Value::from_object(SourceNode {
                    item: item.clone(),
                    misses: Arc::clone(&self.misses),
                }));
            }
        } else if let Some(value) = self.ctx.root(name) {
            return Some(wrap(name.to_string(), value, &self.misses));
        }
        if !ENGINE_GLOBALS.contains(&name) {
            self.misses
                .record(name.to_string(), self.missing_reason(name));
        }
        None
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        let present: Vec<Value> = [
            ROOT_ENV,
            ROOT_VARS,
            ROOT_RUN_TAGS,
            ROOT_PARTITION_KEY,
            ROOT_PARTITION_START,
            ROOT_PARTITION_END,
        ]
        .into_iter()
        .filter(|name| self.ctx.root(name).is_some())
        .chain(self.ctx.item().map(|_| ROOT_SOURCE))
        .map(Value::from)
        .collect();
        Enumerator::Values(present)
    }
}

/// A JSON map below one of the data roots.
#[derive(Debug)]
struct DataNode {
    path: String,
    value: serde_json::Value,
    misses: Arc<MissLog>,
}

impl Object for DataNode {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Map
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        match self.value.get(name) {
            Some(child) => Some(wrap(join(&self.path, name), child, &self.misses)),
            None => {
                self.misses
                    .record(join(&self.path, name), format!("no attribute `{name}`"));
                None
            }
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        match &self.value {
            serde_json::Value::Object(map) => {
                Enumerator::Values(map.keys().map(|k| Value::from(k.as_str())).collect())
            }
            _ => Enumerator::Empty,
        }
    }
}

// ---------------------------------------------------------------------------
// Source item
// ---------------------------------------------------------------------------

/// `source`, holding only `item`.
#[derive(Debug)]
struct SourceNode {
    item: SourceItem,
    misses: Arc<MissLog>,
}

impl Object for SourceNode {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Map
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        if name == "item" {
            return Some(Value::from_object(ItemNode {
                item: self.item.clone(),
                misses: Arc::clone(&self.misses),
            }));
        }
        self.misses
            .record(join(ROOT_SOURCE, name), format!("no attribute `{name}`"));
        None
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["item"])
    }
}

/// `source.item`: only the attributes of the item's own variant resolve.
#[derive(Debug)]
struct ItemNode {
    item: SourceItem,
    misses: Arc<MissLog>,
}

impl Object for ItemNode {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Map
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        if let Some(value) = self.item.attribute(name) {
            return Some(Value::from_serialize(&value));
        }
        self.misses.record(
            format!("{ROOT_SOURCE}.item.{name}"),
            format!(
                "attribute `{name}` is not defined for {} items",
                self.item.kind()
            ),
        );
        None
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(self.item.kind().attributes())
    }
}

// ---------------------------------------------------------------------------
// Helper namespace
// ---------------------------------------------------------------------------

/// `fn`, exposing `fn.date` and `fn.cron`.
#[derive(Debug)]
struct HelperRoot {
    now: DateTime<Utc>,
}

impl Object for HelperRoot {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Map
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        HELPER_NAMESPACES
            .iter()
            .copied()
            .find(|ns| *ns == name)
            .map(|ns| {
                Value::from_object(HelperNamespace {
                    name: ns,
                    now: self.now,
                })
            })
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(HELPER_NAMESPACES)
    }
}

#[derive(Debug)]
struct HelperNamespace {
    name: &'static str,
    now: DateTime<Utc>,
}

impl Object for HelperNamespace {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        let full = format!("{ROOT_HELPERS}.{}.{method}", self.name);
        if !helpers::is_helper(&full) {
            return Err(Error::new(
                ErrorKind::UnknownMethod,
                format!("unknown helper function `{full}`"),
            ));
        }
        let args = args
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("{full}: unsupported argument: {e}"),
                )
            })?;
        helpers::call(&full, &args, self.now)
            .map(|out| Value::from_serialize(&out))
            .map_err(|HelperError(message)| Error::new(ErrorKind::InvalidOperation, message))
    }
}
