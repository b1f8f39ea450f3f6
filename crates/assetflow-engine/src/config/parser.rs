//! Pipeline YAML parsing, environment layering and `${VAR}` substitution.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value};

use crate::config::types::{PipelineDefinition, COMMON_LAYER, DEFAULT_ENVIRONMENT, ENVIRONMENT_VAR};

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns using `lookup`.
///
/// # Errors
///
/// Returns the names of every variable `lookup` could not resolve.
pub fn substitute_with(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> std::result::Result<String, Vec<String>> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        lookup(var_name).unwrap_or_else(|| {
            if !missing.iter().any(|m| m == var_name) {
                missing.push(var_name.to_string());
            }
            String::new()
        })
    });
    if missing.is_empty() {
        Ok(result.into_owned())
    } else {
        Err(missing)
    }
}

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error if any referenced environment variable is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    substitute_with(input, |name| std::env::var(name).ok()).map_err(|missing| {
        anyhow::anyhow!("Missing environment variable(s): {}", missing.join(", "))
    })
}

/// Apply `${VAR}` substitution to every string inside `value`, collecting
/// missing variable names into `missing`.
pub fn substitute_in_value(
    value: &mut Value,
    lookup: &dyn Fn(&str) -> Option<String>,
    missing: &mut Vec<String>,
) {
    match value {
        Value::String(s) => match substitute_with(s, lookup) {
            Ok(replaced) => *s = replaced,
            Err(names) => {
                for name in names {
                    if !missing.contains(&name) {
                        missing.push(name);
                    }
                }
            }
        },
        Value::Array(items) => {
            for item in items {
                substitute_in_value(item, lookup, missing);
            }
        }
        Value::Object(map) => {
            for child in map.values_mut() {
                substitute_in_value(child, lookup, missing);
            }
        }
        _ => {}
    }
}

/// Merge `overlay` into `base`: maps merge key by key, anything else in
/// the overlay replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Merge the `common` layer with the `environment` layer.
#[must_use]
pub fn resolve_layers(layers: &BTreeMap<String, Value>, environment: &str) -> Value {
    let mut merged = Value::Object(Map::new());
    for name in [COMMON_LAYER, environment] {
        if let Some(layer) = layers.get(name) {
            if !layer.is_null() {
                deep_merge(&mut merged, layer.clone());
            }
        }
        if environment == COMMON_LAYER {
            break;
        }
    }
    merged
}

/// Active environment: explicit value, then `ASSETFLOW_ENV`, then `dev`.
#[must_use]
pub fn active_environment(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(ENVIRONMENT_VAR).ok())
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
}

/// Parse a pipeline YAML string.
///
/// # Errors
///
/// Returns an error if the YAML is invalid.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineDefinition> {
    let config: PipelineDefinition =
        serde_yaml::from_str(yaml_str).context("Failed to parse pipeline YAML")?;
    Ok(config)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
}
