//! Pattern and predicate filtering of listed items, and the listing request
//! derived from a rendered source config.

use assetflow_types::item::SourceItem;
use regex::Regex;
use serde_json::{Map, Value};

use crate::connector::ListRequest;
use crate::context::TemplateContext;
use crate::errors::{DiscoveryError, TransferError};
use crate::template::{OperationKind, Predicate, TemplateError, PREDICATE_FIELD};

/// Anchor a user pattern at the start of the subject.
///
/// # Errors
///
/// Returns the regex error for an invalid pattern.
pub fn compile_pattern(raw: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{raw})"))
}

/// Pattern matching exactly one file name.
///
/// # Errors
///
/// Returns the regex error if the escaped name exceeds regex size limits.
pub fn exact_name_pattern(file_name: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^{}$", regex::escape(file_name)))
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("field `{field}`: invalid pattern `{pattern}`: {source}")]
    Pattern {
        field: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{0}")]
    Location(String),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl From<FilterError> for DiscoveryError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::Template(e) => Self::Template(e),
            other => Self::Config(other.to_string()),
        }
    }
}

impl From<FilterError> for TransferError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::Template(e) => Self::Template(e),
            other => Self::Config(other.to_string()),
        }
    }
}

/// Per-item filter declared by a sensor or an asset source.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pattern: Option<Regex>,
    predicate: Option<Predicate>,
}

impl ItemFilter {
    /// Build from a source config whose whitelisted fields are already
    /// rendered. The predicate stays unrendered and is parsed here.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError`] for an invalid pattern or predicate.
    pub fn from_configs(
        configs: &Map<String, Value>,
        kind: OperationKind,
        field_path: &str,
    ) -> Result<Self, FilterError> {
        let field = |key: &str| format!("{field_path}.{key}");

        let pattern = match (kind, configs.get("file_name").and_then(Value::as_str)) {
            (OperationKind::RemoteFile, Some(name)) if !name.is_empty() => {
                Some(exact_name_pattern(name).map_err(|source| FilterError::Pattern {
                    field: field("file_name"),
                    pattern: name.to_string(),
                    source,
                })?)
            }
            _ => match configs.get("pattern").and_then(Value::as_str) {
                Some(raw) if !raw.is_empty() => {
                    Some(compile_pattern(raw).map_err(|source| FilterError::Pattern {
                        field: field("pattern"),
                        pattern: raw.to_string(),
                        source,
                    })?)
                }
                _ => None,
            },
        };

        let predicate = match configs.get(PREDICATE_FIELD).and_then(Value::as_str) {
            Some(raw) if !raw.trim().is_empty() => {
                Some(Predicate::parse(raw, &field(PREDICATE_FIELD))?)
            }
            _ => None,
        };

        Ok(Self { pattern, predicate })
    }

    /// Whether `item` passes the pattern and then the predicate. The
    /// predicate sees a context built for this item only.
    ///
    /// # Errors
    ///
    /// Returns a [`TemplateError`] if the predicate cannot be evaluated.
    pub fn matches(&self, item: &SourceItem, ctx: &TemplateContext) -> Result<bool, TemplateError> {
        if !self.matches_pattern(item) {
            return Ok(false);
        }
        self.accepts(item, ctx)
    }

    /// Pattern half of [`ItemFilter::matches`]; true without a pattern.
    #[must_use]
    pub fn matches_pattern(&self, item: &SourceItem) -> bool {
        self.pattern
            .as_ref()
            .map_or(true, |pattern| pattern.is_match(item.pattern_subject()))
    }

    /// Predicate half of [`ItemFilter::matches`]; true without a predicate.
    ///
    /// # Errors
    ///
    /// Returns a [`TemplateError`] if the predicate cannot be evaluated.
    pub fn accepts(&self, item: &SourceItem, ctx: &TemplateContext) -> Result<bool, TemplateError> {
        match &self.predicate {
            Some(predicate) => predicate.evaluate(&ctx.with_item(item)),
            None => Ok(true),
        }
    }

    #[must_use]
    pub fn has_predicate(&self) -> bool {
        self.predicate.is_some()
    }
}

/// Listing request for a rendered source config.
///
/// Object stores list `bucket_name` under `prefix`, recursively unless
/// `recursive: false`. File sources list `path`, one level unless
/// `recursive: true`.
///
/// # Errors
///
/// Returns [`FilterError::Location`] when the location is missing or the
/// operation kind cannot be listed.
pub fn list_request(
    configs: &Map<String, Value>,
    kind: OperationKind,
    page_size: usize,
) -> Result<ListRequest, FilterError> {
    let get = |key: &str| configs.get(key).and_then(Value::as_str).filter(|s| !s.is_empty());
    let recursive = configs.get("recursive").and_then(Value::as_bool);
    match kind {
        OperationKind::ObjectStore => Ok(ListRequest {
            location: get("bucket_name")
                .ok_or_else(|| FilterError::Location("source has no bucket_name".to_string()))?
                .to_string(),
            prefix: get("prefix").map(str::to_string),
            recursive: recursive.unwrap_or(true),
            page_size,
        }),
        OperationKind::RemoteFile => Ok(ListRequest {
            location: get("path")
                .ok_or_else(|| FilterError::Location("source has no path".to_string()))?
                .to_string(),
            prefix: None,
            recursive: recursive.unwrap_or(false),
            page_size,
        }),
        OperationKind::Database => Err(FilterError::Location(
            "database sources cannot be listed".to_string(),
        )),
    }
}
