//! Semantic validation for parsed pipeline definitions.
//!
//! Every check appends to one problem list so a definition with several
//! mistakes reports all of them at once.

use std::collections::{BTreeMap, BTreeSet};

use assetflow_types::cursor::CursorStrategy;
use serde_json::{Map, Value};

use crate::config::types::{parse_byte_size, ConnectionSpec, PipelineDefinition, Selection};
use crate::connector::RowQuery;
use crate::discovery::filter::compile_pattern;
use crate::partition::PartitionsDef;
use crate::template::helpers::parse_cron;
use crate::template::{self, OperationKind, Predicate, TemplateFields, PREDICATE_FIELD};

/// Selection entry matching every asset.
pub const SELECT_ALL: &str = "*";
/// Prefix of a group selection entry.
pub const GROUP_PREFIX: &str = "group:";

/// Validate a parsed definition against its resolved connections.
///
/// Returns every problem found; an empty list means the definition can be
/// compiled.
#[must_use]
pub fn validate_definition(
    def: &PipelineDefinition,
    connections: &BTreeMap<String, ConnectionSpec>,
) -> Vec<String> {
    let mut errors = Vec::new();

    if def.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    check_unique("Asset", def.assets.iter().map(|a| a.name.as_str()), &mut errors);
    check_unique("Job", def.jobs.iter().map(|j| j.name.as_str()), &mut errors);
    check_unique("Sensor", def.sensors.iter().map(|s| s.name.as_str()), &mut errors);
    check_unique("Schedule", def.schedules.iter().map(|s| s.name.as_str()), &mut errors);

    validate_assets(def, connections, &mut errors);
    validate_jobs(def, &mut errors);

    let jobs: BTreeSet<&str> = def.jobs.iter().map(|j| j.name.as_str()).collect();

    for sensor in &def.sensors {
        let context = format!("Sensor '{}'", sensor.name);
        if !jobs.contains(sensor.job.as_str()) {
            errors.push(format!("{context} targets unknown job '{}'", sensor.job));
        }
        if sensor.minimum_interval_seconds == 0 {
            errors.push(format!("{context}: minimum_interval_seconds must be > 0"));
        }
        match connections.get(&sensor.connection) {
            None => errors.push(format!(
                "{context} references unknown connection '{}'",
                sensor.connection
            )),
            Some(spec) if spec.kind.is_database() => {
                let path = format!("sensors.{}", sensor.name);
                if let Err(e) = RowQuery::from_configs(&sensor.configs) {
                    errors.push(format!("{context}: {e}"));
                }
                check_configs(&sensor.configs, spec.kind.operation_kind(), &path, &mut errors);
            }
            Some(_) if sensor.cursor == CursorStrategy::MaxKey => errors.push(format!(
                "{context}: cursor 'max_key' needs a database connection, not '{}'",
                sensor.connection
            )),
            Some(spec) => {
                let kind = spec.kind.operation_kind();
                check_location(&sensor.configs, kind, &context, &mut errors);
                let path = format!("sensors.{}", sensor.name);
                check_configs(&sensor.configs, kind, &path, &mut errors);
            }
        }
    }

    for schedule in &def.schedules {
        let context = format!("Schedule '{}'", schedule.name);
        if !jobs.contains(schedule.job.as_str()) {
            errors.push(format!("{context} targets unknown job '{}'", schedule.job));
        }
        if let Err(e) = parse_cron(&schedule.cron) {
            errors.push(format!("{context}: {e}"));
        }
    }

    validate_resources(def, &mut errors);
    errors
}

fn check_unique<'a>(what: &str, names: impl Iterator<Item = &'a str>, errors: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    for name in names {
        if name.trim().is_empty() {
            errors.push(format!("{what} name must not be empty"));
        } else if !seen.insert(name) {
            errors.push(format!("{what} '{name}' is defined more than once"));
        }
    }
}

fn validate_assets(
    def: &PipelineDefinition,
    connections: &BTreeMap<String, ConnectionSpec>,
    errors: &mut Vec<String>,
) {
    for asset in &def.assets {
        let context = format!("Asset '{}'", asset.name);

        match connections.get(&asset.source.connection) {
            None => errors.push(format!(
                "{context}: source references unknown connection '{}'",
                asset.source.connection
            )),
            Some(spec) => {
                let kind = spec.kind.operation_kind();
                check_location(&asset.source.configs, kind, &format!("{context}: source"), errors);
                let path = format!("assets.{}.source", asset.name);
                check_configs(&asset.source.configs, kind, &path, errors);
            }
        }

        match connections.get(&asset.target.connection) {
            None => errors.push(format!(
                "{context}: target references unknown connection '{}'",
                asset.target.connection
            )),
            Some(spec) => check_configs(
                &asset.target.configs,
                spec.kind.operation_kind(),
                &format!("assets.{}.target", asset.name),
                errors,
            ),
        }

        if asset.max_workers == Some(0) {
            errors.push(format!("{context}: max_workers must be at least 1"));
        }
        if let Some(cron) = &asset.cron {
            if let Err(e) = parse_cron(cron) {
                errors.push(format!("{context}: {e}"));
            }
        }
        if let Some(partitions) = &asset.partitions {
            if let Err(e) = PartitionsDef::from_config(partitions) {
                errors.push(format!("{context}: invalid partitions: {e}"));
            }
        }
    }
}

fn validate_jobs(def: &PipelineDefinition, errors: &mut Vec<String>) {
    let assets: BTreeSet<&str> = def.assets.iter().map(|a| a.name.as_str()).collect();
    let groups: BTreeSet<&str> = def.assets.iter().filter_map(|a| a.group.as_deref()).collect();

    for job in &def.jobs {
        if matches!(&job.selection, Selection::Many(v) if v.is_empty()) {
            errors.push(format!("Job '{}' selects no assets", job.name));
        }
        for entry in job.selection.entries() {
            if entry == SELECT_ALL {
                continue;
            }
            if let Some(group) = entry.strip_prefix(GROUP_PREFIX) {
                if !groups.contains(group) {
                    errors.push(format!("Job '{}' selects unknown group '{group}'", job.name));
                }
            } else if !assets.contains(entry) {
                errors.push(format!("Job '{}' selects unknown asset '{entry}'", job.name));
            }
        }
    }
}

fn validate_resources(def: &PipelineDefinition, errors: &mut Vec<String>) {
    let res = &def.resources;
    for (key, budget) in &res.pools {
        if *budget == 0 {
            errors.push(format!("Pool '{key}' budget must be at least 1"));
        }
    }
    if res.default_pool_budget == 0 {
        errors.push("default_pool_budget must be at least 1".to_string());
    }
    if res.max_workers == 0 {
        errors.push("max_workers must be at least 1".to_string());
    }
    if res.page_size == 0 {
        errors.push("page_size must be at least 1".to_string());
    }
    if res.progress_step_percent == 0 || res.progress_step_percent > 100 {
        errors.push("progress_step_percent must be between 1 and 100".to_string());
    }
    if let Err(e) = parse_byte_size(&res.stream_threshold) {
        errors.push(format!("Invalid stream_threshold: {e}"));
    }
    match parse_byte_size(&res.chunk_size) {
        Ok(0) => errors.push("chunk_size must be greater than zero".to_string()),
        Ok(_) => {}
        Err(e) => errors.push(format!("Invalid chunk_size: {e}")),
    }
}

/// A listing source must say where to look.
fn check_location(
    configs: &Map<String, Value>,
    kind: OperationKind,
    context: &str,
    errors: &mut Vec<String>,
) {
    let required: &[&str] = match kind {
        OperationKind::ObjectStore => &["bucket_name"],
        OperationKind::RemoteFile => &["path"],
        OperationKind::Database => &["query", "table_name"],
    };
    let present = required
        .iter()
        .any(|key| configs.get(*key).and_then(Value::as_str).is_some_and(|v| !v.is_empty()));
    if !present {
        errors.push(format!(
            "{context} configs must set '{}'",
            required.join("' or '")
        ));
    }
}

/// Every whitelisted string must parse; raw patterns must compile.
fn check_configs(
    configs: &Map<String, Value>,
    kind: OperationKind,
    path: &str,
    errors: &mut Vec<String>,
) {
    let fields = TemplateFields::standard();
    for (key, value) in configs {
        let field = format!("{path}.{key}");
        match value {
            Value::String(raw) if key == PREDICATE_FIELD => {
                if let Err(e) = Predicate::parse(raw, &field) {
                    errors.push(e.to_string());
                }
            }
            Value::String(raw) if fields.is_whitelisted(kind, key) => {
                if let Err(e) = template::validate_syntax(raw, &field) {
                    errors.push(e.to_string());
                } else if key == "pattern" && !raw.contains("{{") {
                    if let Err(e) = compile_pattern(raw) {
                        errors.push(format!("field `{field}`: invalid pattern: {e}"));
                    }
                }
            }
            Value::Array(items) if fields.is_whitelisted(kind, key) => {
                for (i, item) in items.iter().enumerate() {
                    if let Value::String(raw) = item {
                        if let Err(e) = template::validate_syntax(raw, &format!("{field}[{i}]")) {
                            errors.push(e.to_string());
                        }
                    }
                }
            }
            Value::Object(nested) => check_configs(nested, kind, &field, errors),
            _ => {}
        }
    }
}
