//! Where an item lands: the target configs rendered against the item's
//! context.

use assetflow_types::error::ConnectorError;
use assetflow_types::item::SourceItem;
use serde_json::{Map, Value};

use crate::compiler::EndpointSpec;
use crate::connector::TargetLocation;
use crate::context::TemplateContext;
use crate::errors::ItemFailure;
use crate::template::{render_value, OperationKind, TemplateFields};

/// Keys consumed by location resolution; everything else is passed on as
/// options.
const LOCATION_KEYS: &[&str] = &["bucket_name", "path", "prefix", "key", "file_name"];

/// Render the target configs for `item` and derive its location.
///
/// Object stores land at `bucket_name` under an explicit `key`, or under
/// `prefix/<object or file name>`. File targets land in `path` under an
/// explicit `file_name` or the item's own name. Database targets address
/// `schema_name`.`table_name`; `sql_pre` / `sql_post` ride along in the
/// options.
///
/// # Errors
///
/// Returns [`ItemFailure::Template`] when a field cannot be rendered, or a
/// config failure when no key can be derived.
pub fn resolve_location(
    target: &EndpointSpec,
    ctx: &TemplateContext,
    item: Option<&SourceItem>,
) -> Result<TargetLocation, ItemFailure> {
    let kind = target.operation_kind();
    let rendered = match render_value(
        &Value::Object(target.configs.clone()),
        ctx,
        kind,
        TemplateFields::standard(),
        "target",
    )? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let get = |key: &str| {
        rendered
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let item_name = item.map(|i| i.display_name().to_string());

    let (container, key) = match kind {
        OperationKind::ObjectStore => {
            let bucket = get("bucket_name").ok_or_else(|| missing("target has no bucket_name"))?;
            let key = match get("key") {
                Some(key) => key,
                None => {
                    let name = item_name
                        .ok_or_else(|| missing("target has no key and no source item"))?;
                    match get("prefix") {
                        Some(prefix) => format!("{}/{name}", prefix.trim_end_matches('/')),
                        None => name,
                    }
                }
            };
            (bucket, key)
        }
        OperationKind::RemoteFile => {
            let path = get("path").ok_or_else(|| missing("target has no path"))?;
            let name = get("file_name")
                .or(item_name)
                .ok_or_else(|| missing("target has no file_name and no source item"))?;
            (path, name)
        }
        OperationKind::Database => {
            let table = get("table_name").ok_or_else(|| missing("target has no table_name"))?;
            (get("schema_name").unwrap_or_default(), table)
        }
    };

    let options = rendered
        .into_iter()
        .filter(|(k, _)| !LOCATION_KEYS.contains(&k.as_str()))
        .collect();
    Ok(TargetLocation {
        container,
        key,
        options,
    })
}

fn missing(message: &str) -> ItemFailure {
    ConnectorError::config("TARGET_LOCATION", message).into()
}
