//! Template context construction.
//!
//! A [`TemplateContext`] is an immutable snapshot of everything a template
//! may reference. The run-wide part (environment, vars, run tags, partition
//! window, injected clock) sits behind an `Arc` so per-item contexts built
//! by transfer workers share it read-only and only add their own
//! `source.item`.

use std::collections::BTreeMap;
use std::sync::Arc;

use assetflow_types::item::SourceItem;
use assetflow_types::state::PartitionKey;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Root name of environment variables.
pub const ROOT_ENV: &str = "env";
/// Root name of global vars.
pub const ROOT_VARS: &str = "vars";
/// Root name of run tags.
pub const ROOT_RUN_TAGS: &str = "run_tags";
pub const ROOT_PARTITION_KEY: &str = "partition_key";
pub const ROOT_PARTITION_START: &str = "partition_start";
pub const ROOT_PARTITION_END: &str = "partition_end";
/// Root holding `source.item`.
pub const ROOT_SOURCE: &str = "source";
/// Helper namespace. Never resolved from data.
pub const ROOT_HELPERS: &str = "fn";

/// Partition window frozen for one asset execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionWindow {
    pub key: PartitionKey,
    /// Window bounds; absent for static partitions.
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl PartitionWindow {
    /// Window with no time bounds.
    #[must_use]
    pub fn key_only(key: PartitionKey) -> Self {
        Self {
            key,
            start: None,
            end: None,
        }
    }
}

/// Render an instant the way templates see it (`2024-01-15T00:00:00Z`).
#[must_use]
pub fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug)]
struct ContextBase {
    roots: BTreeMap<String, Value>,
    partition: Option<PartitionWindow>,
    now: DateTime<Utc>,
}

#[derive(Debug)]
struct ItemScope {
    item: SourceItem,
    /// `{"item": {<attributes>}}`, resolved under [`ROOT_SOURCE`].
    source: Value,
}

impl ItemScope {
    fn new(item: &SourceItem) -> Self {
        let attributes: Map<String, Value> = item
            .kind()
            .attributes()
            .iter()
            .filter_map(|name| item.attribute(name).map(|v| ((*name).to_string(), v)))
            .collect();
        let mut source = Map::new();
        source.insert("item".to_string(), Value::Object(attributes));
        Self {
            item: item.clone(),
            source: Value::Object(source),
        }
    }
}

/// Immutable variable scope for one evaluation.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    base: Arc<ContextBase>,
    item: Option<Arc<ItemScope>>,
}

impl TemplateContext {
    /// Build a context from its layers.
    ///
    /// Layers apply in fixed order: environment, global vars, run tags,
    /// partition fields, source item. The helper namespace is resolved
    /// before any data root, so data can never shadow it.
    #[must_use]
    pub fn build(
        env: BTreeMap<String, String>,
        vars: Value,
        run_tags: BTreeMap<String, String>,
        partition: Option<PartitionWindow>,
        item: Option<&SourceItem>,
        now: DateTime<Utc>,
    ) -> Self {
        ContextBuilder::new(now)
            .env(env)
            .vars(vars)
            .run_tags(run_tags)
            .partition(partition)
            .build()
            .with_optional_item(item)
    }

    /// Context sharing this one's run-wide layers with `item` as
    /// `source.item`.
    #[must_use]
    pub fn with_item(&self, item: &SourceItem) -> Self {
        Self {
            base: Arc::clone(&self.base),
            item: Some(Arc::new(ItemScope::new(item))),
        }
    }

    fn with_optional_item(self, item: Option<&SourceItem>) -> Self {
        match item {
            Some(item) => self.with_item(item),
            None => self,
        }
    }

    /// Resolve a data root. `source` is only defined while an item is bound.
    #[must_use]
    pub fn root(&self, name: &str) -> Option<&Value> {
        if name == ROOT_SOURCE {
            return self.item.as_ref().map(|scope| &scope.source);
        }
        self.base.roots.get(name)
    }

    #[must_use]
    pub fn item(&self) -> Option<&SourceItem> {
        self.item.as_ref().map(|scope| &scope.item)
    }

    #[must_use]
    pub fn partition(&self) -> Option<&PartitionWindow> {
        self.base.partition.as_ref()
    }

    /// Injected evaluation instant.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.base.now
    }
}

/// Step-by-step construction of the run-wide part of a [`TemplateContext`].
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    env: BTreeMap<String, String>,
    vars: Value,
    run_tags: BTreeMap<String, String>,
    partition: Option<PartitionWindow>,
    now: DateTime<Utc>,
}

impl ContextBuilder {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            env: BTreeMap::new(),
            vars: Value::Object(Map::new()),
            run_tags: BTreeMap::new(),
            partition: None,
            now,
        }
    }

    /// Replace the injected evaluation instant.
    #[must_use]
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    #[must_use]
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Snapshot the current process environment.
    #[must_use]
    pub fn process_env(self) -> Self {
        self.env(std::env::vars().collect())
    }

    #[must_use]
    pub fn vars(mut self, vars: Value) -> Self {
        self.vars = if vars.is_null() {
            Value::Object(Map::new())
        } else {
            vars
        };
        self
    }

    #[must_use]
    pub fn run_tags(mut self, run_tags: BTreeMap<String, String>) -> Self {
        self.run_tags = run_tags;
        self
    }

    #[must_use]
    pub fn partition(mut self, partition: Option<PartitionWindow>) -> Self {
        self.partition = partition;
        self
    }

    #[must_use]
    pub fn build(self) -> TemplateContext {
        let mut roots = BTreeMap::new();
        let string_map = |map: BTreeMap<String, String>| {
            Value::Object(map.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
        };

        roots.insert(ROOT_ENV.to_string(), string_map(self.env));
        roots.insert(ROOT_VARS.to_string(), self.vars);
        roots.insert(ROOT_RUN_TAGS.to_string(), string_map(self.run_tags));
        if let Some(window) = &self.partition {
            roots.insert(
                ROOT_PARTITION_KEY.to_string(),
                Value::String(window.key.to_string()),
            );
            if let Some(start) = &window.start {
                roots.insert(
                    ROOT_PARTITION_START.to_string(),
                    Value::String(format_instant(start)),
                );
            }
            if let Some(end) = &window.end {
                roots.insert(ROOT_PARTITION_END.to_string(), Value::String(format_instant(end)));
            }
        }

        TemplateContext {
            base: Arc::new(ContextBase {
                roots,
                partition: self.partition,
                now: self.now,
            }),
            item: None,
        }
    }
}
