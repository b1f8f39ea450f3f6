//! Template evaluation for whitelisted configuration fields.
//!
//! Templates are Jinja-style text rendered by `minijinja` with strict
//! undefined handling. Rendering never falls back to an empty string: an
//! unknown variable, an attribute the bound source item does not define, or
//! a malformed block is an error naming the field and the token.

mod fields;
pub mod helpers;
mod scope;

use std::sync::LazyLock;

use minijinja::value::ValueKind;
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde_json::{Map, Value};

use crate::context::TemplateContext;
pub use fields::{OperationKind, TemplateFields, PREDICATE_FIELD};

use scope::Scope;

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env
});

/// Failure to render a templated field.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    /// A variable, attribute or key does not exist in the context.
    #[error("field `{field}`: cannot resolve `{token}`: {reason}")]
    Unresolved {
        field: String,
        token: String,
        reason: String,
    },

    #[error("field `{field}`: malformed template at position {position}: {message}")]
    Malformed {
        field: String,
        position: usize,
        message: String,
    },

    #[error("field `{field}`: {message}")]
    Type { field: String, message: String },
}

impl TemplateError {
    /// Path of the field that failed.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Unresolved { field, .. }
            | Self::Malformed { field, .. }
            | Self::Type { field, .. } => field,
        }
    }

    fn from_engine(field: &str, source: &str, err: &minijinja::Error) -> Self {
        let message = err
            .detail()
            .map_or_else(|| err.kind().to_string(), str::to_string);
        match err.kind() {
            ErrorKind::SyntaxError => Self::Malformed {
                field: field.to_string(),
                position: err.range().map_or(0, |r| r.start),
                message,
            },
            ErrorKind::UndefinedError => Self::Unresolved {
                field: field.to_string(),
                token: err
                    .range()
                    .and_then(|r| source.get(r))
                    .unwrap_or(source)
                    .trim()
                    .to_string(),
                reason: message,
            },
            _ => Self::Type {
                field: field.to_string(),
                message,
            },
        }
    }
}

/// Settle one engine call. A recorded miss wins over the engine's own
/// outcome, so an undefined value consumed without error still fails.
fn settle<T>(
    scope: &Scope,
    field: &str,
    source: &str,
    outcome: Result<T, minijinja::Error>,
) -> Result<T, TemplateError> {
    if let Some(miss) = scope.take_miss() {
        return Err(TemplateError::Unresolved {
            field: field.to_string(),
            token: miss.token,
            reason: miss.reason,
        });
    }
    outcome.map_err(|e| TemplateError::from_engine(field, source, &e))
}

/// Render one raw string.
///
/// Non-whitelisted values come back untouched even when they contain `{{`.
///
/// # Errors
///
/// Returns a [`TemplateError`] naming `field` when a whitelisted value
/// cannot be rendered.
pub fn render(
    raw: &str,
    ctx: &TemplateContext,
    whitelisted: bool,
    field: &str,
) -> Result<String, TemplateError> {
    if !whitelisted || !raw.contains("{{") {
        return Ok(raw.to_string());
    }
    let template = ENGINE
        .template_from_str(raw)
        .map_err(|e| TemplateError::from_engine(field, raw, &e))?;
    let scope = Scope::new(ctx);
    let outcome = template.render(scope.value());
    settle(&scope, field, raw, outcome)
}

/// Check that `raw` parses as a template without rendering it.
///
/// # Errors
///
/// Returns [`TemplateError::Malformed`] on a syntax error.
pub fn validate_syntax(raw: &str, field: &str) -> Result<(), TemplateError> {
    ENGINE
        .template_from_str(raw)
        .map(drop)
        .map_err(|e| TemplateError::from_engine(field, raw, &e))
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// Render every whitelisted string inside a config value.
///
/// Keys are checked against `fields` for `kind`; whitelisted strings render,
/// whitelisted lists render element-wise, nested maps recurse. The
/// [`PREDICATE_FIELD`] is left as written since it is evaluated per item.
///
/// # Errors
///
/// Returns the first [`TemplateError`], with a path such as
/// `target.csv_options.delimiter` or `source.sql_pre[1]`.
pub fn render_value(
    value: &Value,
    ctx: &TemplateContext,
    kind: OperationKind,
    fields: &TemplateFields,
    path: &str,
) -> Result<Value, TemplateError> {
    let Value::Object(map) = value else {
        return Ok(value.clone());
    };

    let mut out = Map::with_capacity(map.len());
    for (key, child) in map {
        let child_path = join_path(path, key);
        let whitelisted = key != PREDICATE_FIELD && fields.is_whitelisted(kind, key);
        let rendered = match child {
            Value::String(s) => Value::String(render(s, ctx, whitelisted, &child_path)?),
            Value::Array(items) if whitelisted => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| match item {
                        Value::String(s) => {
                            render(s, ctx, true, &format!("{child_path}[{i}]")).map(Value::String)
                        }
                        other => Ok(other.clone()),
                    })
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(_) => render_value(child, ctx, kind, fields, &child_path)?,
            other => other.clone(),
        };
        out.insert(key.clone(), rendered);
    }
    Ok(Value::Object(out))
}

/// Per-item boolean filter.
///
/// A predicate with `{{ }}` blocks must render to `true`/`True`/`false`/
/// `False`; one without delimiters is read as a bare expression and must
/// evaluate to a boolean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    raw: String,
    field: String,
    wrapped: bool,
}

impl Predicate {
    /// # Errors
    ///
    /// Returns [`TemplateError::Malformed`] if the expression does not parse.
    pub fn parse(raw: &str, field: &str) -> Result<Self, TemplateError> {
        let wrapped = raw.contains("{{");
        let checked = if wrapped {
            ENGINE.template_from_str(raw).map(drop)
        } else {
            ENGINE.compile_expression(raw).map(drop)
        };
        checked.map_err(|e| TemplateError::from_engine(field, raw, &e))?;
        Ok(Self {
            raw: raw.to_string(),
            field: field.to_string(),
            wrapped,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Evaluate against an item-scoped context.
    ///
    /// # Errors
    ///
    /// Returns a [`TemplateError`] if evaluation fails or the result is not
    /// a boolean.
    pub fn evaluate(&self, ctx: &TemplateContext) -> Result<bool, TemplateError> {
        let scope = Scope::new(ctx);
        if self.wrapped {
            let outcome = ENGINE
                .template_from_str(&self.raw)
                .and_then(|t| t.render(scope.value()));
            let text = settle(&scope, &self.field, &self.raw, outcome)?;
            return match text.trim() {
                "true" | "True" => Ok(true),
                "false" | "False" => Ok(false),
                other => Err(self.not_boolean(&format!("`{other}`"))),
            };
        }

        let outcome = ENGINE
            .compile_expression(&self.raw)
            .and_then(|e| e.eval(scope.value()));
        let value = settle(&scope, &self.field, &self.raw, outcome)?;
        match value.kind() {
            ValueKind::Bool => Ok(value.is_true()),
            kind => Err(self.not_boolean(&kind.to_string())),
        }
    }

    fn not_boolean(&self, got: &str) -> TemplateError {
        TemplateError::Type {
            field: self.field.clone(),
            message: format!("predicate must evaluate to a boolean, got {got}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextBuilder, PartitionWindow};
    use assetflow_types::item::{FileMeta, ObjectMeta, SourceItem};
    use assetflow_types::state::PartitionKey;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn ctx() -> TemplateContext {
        let window = PartitionWindow {
            key: PartitionKey::new("2024-01-14"),
            start: Some(Utc.with_ymd_and_hms(2024, 1, 14, 0, 0, 0).unwrap()),
            end: Some(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()),
        };
        ContextBuilder::new(Utc.with_ymd_and_hms(2024, 1, 15, 6, 0, 0).unwrap())
            .env([("STAGE".to_string(), "prod".to_string())].into())
            .vars(json!({"bucket": "landing", "schema": "raw"}))
            .partition(Some(window))
            .build()
    }

    fn object_item() -> SourceItem {
        ObjectMeta::new("landing", "in/2024/orders.csv", Some("in/".into()), 2048, 1_705_200_000)
            .into()
    }

    #[test]
    fn renders_mixed_text_and_expressions() {
        let out = render(
            "exports/{{ env.STAGE }}/{{ fn.date.to_date_nodash(partition_start) }}/",
            &ctx(),
            true,
            "target.prefix",
        )
        .unwrap();
        assert_eq!(out, "exports/prod/20240114/");
    }

    #[test]
    fn non_whitelisted_field_is_verbatim() {
        let raw = r"^{{ not a template }}\d+$";
        assert_eq!(render(raw, &ctx(), false, "source.regex").unwrap(), raw);
    }

    #[test]
    fn unknown_variable_fails_instead_of_blanking() {
        let err = render("{{ vars.nope }}", &ctx(), true, "source.prefix").unwrap_err();
        assert_eq!(
            err,
            TemplateError::Unresolved {
                field: "source.prefix".to_string(),
                token: "vars.nope".to_string(),
                reason: "no attribute `nope`".to_string(),
            }
        );
        assert_eq!(err.field(), "source.prefix");
    }

    #[test]
    fn file_attribute_on_object_item_fails() {
        let scoped = ctx().with_item(&object_item());
        let err = render("{{ source.item.file_name }}", &scoped, true, "target.key").unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Unresolved { ref token, .. } if token == "source.item.file_name"
        ));
    }

    #[test]
    fn unterminated_block_is_malformed() {
        let err = render("a/{{ vars.bucket", &ctx(), true, "target.key").unwrap_err();
        assert!(matches!(err, TemplateError::Malformed { ref field, .. } if field == "target.key"));
        assert!(validate_syntax("a/{{ vars.bucket", "target.key").is_err());
        assert!(validate_syntax("a/{{ vars.bucket }}", "target.key").is_ok());
    }

    #[test]
    fn stray_closing_braces_are_text() {
        assert_eq!(render("a }} b", &ctx(), true, "f").unwrap(), "a }} b");
    }

    #[test]
    fn filters_and_helpers_compose() {
        let out = render(
            concat!(
                "{{ vars.bucket | upper }}/",
                "{{ fn.cron.range(partition_start, partition_end, '0 */12 * * *') | length }}",
            ),
            &ctx(),
            true,
            "target.prefix",
        )
        .unwrap();
        assert_eq!(out, "LANDING/2");
    }

    #[test]
    fn helper_failure_is_a_type_error() {
        let err =
            render("{{ fn.date.to_date_nodash('yesterday') }}", &ctx(), true, "f").unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Type { ref message, .. } if message.contains("yesterday")
        ));
        let err = render("{{ fn.date.tomorrow() }}", &ctx(), true, "f").unwrap_err();
        assert!(matches!(err, TemplateError::Type { .. }));
    }

    #[test]
    fn integer_overflow_is_an_error_not_a_panic() {
        for expr in [
            "{{ (-9223372036854775807 - 1) % -1 }}",
            "{{ (-9223372036854775807 - 1) // -1 }}",
            "{{ 9223372036854775807 * 9223372036854775807 * 9223372036854775807 }}",
        ] {
            let out = render(expr, &ctx(), true, "target.key");
            assert!(
                matches!(out, Ok(_) | Err(TemplateError::Type { .. })),
                "{expr}: {out:?}"
            );
        }
    }

    #[test]
    fn unbound_source_item_is_reported() {
        let err = render("{{ source.item.file_name }}", &ctx(), true, "target.key").unwrap_err();
        assert_eq!(
            err,
            TemplateError::Unresolved {
                field: "target.key".to_string(),
                token: "source".to_string(),
                reason: "no source item in this context".to_string(),
            }
        );
    }

    #[test]
    fn defined_test_does_not_hide_a_missing_attribute() {
        let scoped = ctx().with_item(&object_item());
        let err = render(
            "{{ 'a' if source.item.file_name is defined else 'b' }}",
            &scoped,
            true,
            "target.key",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Unresolved { ref token, .. } if token == "source.item.file_name"
        ));
    }

    #[test]
    fn trailing_newline_is_kept() {
        assert_eq!(render("{{ vars.bucket }}\n", &ctx(), true, "f").unwrap(), "landing\n");
    }

    #[test]
    fn render_value_walks_whitelisted_keys() {
        let config = json!({
            "table_name": "orders_{{ fn.date.to_date_nodash(partition_start) }}",
            "sql_pre": ["DELETE FROM {{ vars.schema }}.orders", 5],
            "if_exists": "{{ untouched }}",
            "csv_options": {"delimiter": "{{ '|' }}", "header": "{{ raw }}"},
        });
        let out = render_value(
            &config,
            &ctx(),
            OperationKind::Database,
            TemplateFields::standard(),
            "target",
        )
        .unwrap();
        assert_eq!(
            out,
            json!({
                "table_name": "orders_20240114",
                "sql_pre": ["DELETE FROM raw.orders", 5],
                "if_exists": "{{ untouched }}",
                "csv_options": {"delimiter": "|", "header": "{{ raw }}"},
            })
        );
    }

    #[test]
    fn render_value_reports_list_element_path() {
        let config = json!({"sql_post": ["ok", "{{ vars.missing }}"]});
        let err = render_value(
            &config,
            &ctx(),
            OperationKind::Database,
            TemplateFields::standard(),
            "target",
        )
        .unwrap_err();
        assert_eq!(err.field(), "target.sql_post[1]");
    }

    #[test]
    fn render_value_leaves_predicate_for_item_evaluation() {
        let config = json!({
            "prefix": "{{ vars.bucket }}/",
            "predicate": "{{ source.item.size > 0 }}"
        });
        let out = render_value(
            &config,
            &ctx(),
            OperationKind::ObjectStore,
            TemplateFields::standard(),
            "source",
        )
        .unwrap();
        assert_eq!(out["prefix"], "landing/");
        assert_eq!(out["predicate"], "{{ source.item.size > 0 }}");
    }

    #[test]
    fn predicate_forms() {
        let scoped = ctx().with_item(&object_item());
        let wrapped =
            Predicate::parse("{{ source.item.size > 1024 }}", "source.predicate").unwrap();
        assert!(wrapped.evaluate(&scoped).unwrap());

        let bare = Predicate::parse("source.item.size < 1024", "p").unwrap();
        assert!(!bare.evaluate(&scoped).unwrap());

        let textual = Predicate::parse("{{ 'True' }}", "p").unwrap();
        assert!(textual.evaluate(&scoped).unwrap());
    }

    #[test]
    fn predicate_must_be_boolean() {
        let scoped = ctx().with_item(&object_item());
        let p = Predicate::parse("{{ source.item.size }}", "source.predicate").unwrap();
        let err = p.evaluate(&scoped).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Type { ref message, .. } if message.contains("`2048`")
        ));

        let bare = Predicate::parse("source.item.size", "source.predicate").unwrap();
        let err = bare.evaluate(&scoped).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Type { ref message, .. } if message.contains("boolean")
        ));
    }

    #[test]
    fn malformed_bare_predicate_is_rejected() {
        let err = Predicate::parse("source.item.size >", "p").unwrap_err();
        assert!(matches!(err, TemplateError::Malformed { ref field, .. } if field == "p"));
    }

    #[test]
    fn predicate_on_wrong_variant_fails() {
        let file: SourceItem = FileMeta::new("a.csv", "/in/a.csv", 1, 1).into();
        let p = Predicate::parse("source.item.bucket_name == 'x'", "p").unwrap();
        let err = p.evaluate(&ctx().with_item(&file)).unwrap_err();
        assert_eq!(
            err,
            TemplateError::Unresolved {
                field: "p".to_string(),
                token: "source.item.bucket_name".to_string(),
                reason: "attribute `bucket_name` is not defined for file items".to_string(),
            }
        );
    }
}
