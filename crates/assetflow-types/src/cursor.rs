//! Cursor types for incremental discovery.
//!
//! A cursor marks what a sensor has already emitted so the next poll only
//! produces newer items.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::item::SourceItem;

/// How a sensor decides whether an item is new.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorStrategy {
    /// High-water mark over `modified_ts`; strictly newer items pass.
    #[default]
    ModifiedTs,
    /// Largest secondary key (name or key) seen so far; for sources whose
    /// names sort in arrival order.
    Name,
    /// Explicit set of emitted identities.
    SeenSet,
    /// Largest value of a database cursor column; the comparison runs in
    /// the database, so only row sources use it.
    MaxKey,
}

/// Value of a database cursor column.
///
/// Integers order before text, so a column must keep one type for its
/// cursor to stay meaningful.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowKey {
    Int(i64),
    Text(String),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Rows found beyond a cursor in one poll of a row source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBatch {
    pub cursor_column: String,
    /// Cursor the poll started from; `None` on the first poll.
    pub last: Option<RowKey>,
    /// Largest cursor value among the new rows.
    pub upper: RowKey,
    pub record_count: u64,
}

/// Typed cursor position.
///
/// Serialized as `{"type": "high_water_mark", "value": 42}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CursorValue {
    /// Maximum emitted modification time, epoch seconds.
    HighWaterMark { value: i64 },
    /// Maximum emitted secondary key.
    Marker { value: String },
    /// Identities already emitted.
    SeenSet { value: BTreeSet<String> },
    /// Maximum cursor column value emitted by a row source.
    MaxKey { value: RowKey },
}

impl CursorValue {
    /// Whether `item` lies beyond this cursor.
    #[must_use]
    pub fn admits(&self, item: &SourceItem) -> bool {
        match self {
            Self::HighWaterMark { value } => item.modified_ts() > *value,
            Self::Marker { value } => item.secondary_key() > value.as_str(),
            Self::SeenSet { value } => !value.contains(&item.identity()),
            // Row sources filter in the query.
            Self::MaxKey { .. } => true,
        }
    }

    /// Strategy this value was produced by.
    #[must_use]
    pub fn strategy(&self) -> CursorStrategy {
        match self {
            Self::HighWaterMark { .. } => CursorStrategy::ModifiedTs,
            Self::Marker { .. } => CursorStrategy::Name,
            Self::SeenSet { .. } => CursorStrategy::SeenSet,
            Self::MaxKey { .. } => CursorStrategy::MaxKey,
        }
    }

    /// Position to resume a row source from.
    #[must_use]
    pub fn row_key(&self) -> Option<&RowKey> {
        match self {
            Self::MaxKey { value } => Some(value),
            _ => None,
        }
    }
}

impl CursorStrategy {
    /// Cursor after emitting `emitted` on top of `previous`.
    ///
    /// For [`CursorStrategy::SeenSet`] the previous set is first pruned to
    /// `still_listed` so it stays bounded by the size of the source.
    /// Returns `None` when there is neither a previous cursor nor anything
    /// emitted.
    #[must_use]
    pub fn advance(
        self,
        previous: Option<&CursorValue>,
        emitted: &[SourceItem],
        still_listed: &BTreeSet<String>,
    ) -> Option<CursorValue> {
        match self {
            Self::ModifiedTs => {
                let prev = match previous {
                    Some(CursorValue::HighWaterMark { value }) => Some(*value),
                    _ => None,
                };
                let max = emitted.iter().map(SourceItem::modified_ts).max();
                prev.into_iter()
                    .chain(max)
                    .max()
                    .map(|value| CursorValue::HighWaterMark { value })
            }
            Self::Name => {
                let prev = match previous {
                    Some(CursorValue::Marker { value }) => Some(value.as_str()),
                    _ => None,
                };
                let max = emitted.iter().map(SourceItem::secondary_key).max();
                prev.into_iter().chain(max).max().map(|value| CursorValue::Marker {
                    value: value.to_string(),
                })
            }
            Self::SeenSet => {
                let mut value: BTreeSet<String> = match previous {
                    Some(CursorValue::SeenSet { value }) => {
                        value.intersection(still_listed).cloned().collect()
                    }
                    _ => BTreeSet::new(),
                };
                value.extend(emitted.iter().map(SourceItem::identity));
                if value.is_empty() && previous.is_none() {
                    None
                } else {
                    Some(CursorValue::SeenSet { value })
                }
            }
            // Listed items carry no row key; see `advance_rows`.
            Self::MaxKey => previous.filter(|p| p.strategy() == Self::MaxKey).cloned(),
        }
    }

    /// Cursor after a row source reported `batch` on top of `previous`.
    ///
    /// Never moves backwards, even if the source returns a smaller key.
    #[must_use]
    pub fn advance_rows(
        previous: Option<&CursorValue>,
        batch: Option<&RowBatch>,
    ) -> Option<CursorValue> {
        let prev = previous.and_then(CursorValue::row_key);
        prev.into_iter()
            .chain(batch.map(|b| &b.upper))
            .max()
            .map(|value| CursorValue::MaxKey { value: value.clone() })
    }
}
