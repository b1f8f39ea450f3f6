//! Run requests emitted by sensors and schedules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cursor::RowBatch;
use crate::item::SourceItem;
use crate::state::{PartitionKey, SensorName};

/// Name of the sensor that emitted the request.
pub const TAG_SENSOR: &str = "factory/sensor";
/// Identity of the triggering item.
pub const TAG_SOURCE_ITEM: &str = "factory/source_item";
/// Modification time of the triggering item.
pub const TAG_SOURCE_MTIME: &str = "factory/source_mtime";
/// JSON of the triggering item, hydrated back into `source.item`.
pub const TAG_SOURCE_METADATA: &str = "factory/source_metadata";
/// Partition the run materializes.
pub const TAG_PARTITION_KEY: &str = "factory/partition_key";
/// Name of the schedule that emitted the request.
pub const TAG_SCHEDULE: &str = "factory/schedule";
/// Largest cursor column value covered by a row-triggered run.
pub const TAG_ROW_CURSOR: &str = "factory/cursor";
/// Cursor the row window starts after; empty on the first window.
pub const TAG_ROW_LAST_CURSOR: &str = "factory/last_cursor";
/// Number of rows in the window.
pub const TAG_ROW_COUNT: &str = "factory/record_count";

/// A request to run a job, carrying its trigger as opaque tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Deduplication key; equal keys describe the same unit of work.
    pub run_key: String,
    pub job: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RunRequest {
    /// Request triggered by one discovered item.
    ///
    /// # Errors
    ///
    /// Returns an error if the item cannot be serialized into the metadata tag.
    pub fn for_item(
        sensor: &SensorName,
        job: impl Into<String>,
        item: &SourceItem,
        partition: Option<&PartitionKey>,
    ) -> Result<Self, serde_json::Error> {
        let identity = item.identity();
        let mtime = item.modified_ts();
        let mut tags = BTreeMap::new();
        tags.insert(TAG_SENSOR.to_string(), sensor.to_string());
        tags.insert(TAG_SOURCE_ITEM.to_string(), identity.clone());
        tags.insert(TAG_SOURCE_MTIME.to_string(), mtime.to_string());
        tags.insert(TAG_SOURCE_METADATA.to_string(), serde_json::to_string(item)?);
        if let Some(key) = partition {
            tags.insert(TAG_PARTITION_KEY.to_string(), key.to_string());
        }
        Ok(Self {
            run_key: format!("{sensor}:{identity}:{mtime}"),
            job: job.into(),
            tags,
        })
    }

    /// Request covering the rows of `batch`, i.e. those with
    /// `last < cursor_column <= upper`.
    #[must_use]
    pub fn for_rows(
        sensor: &SensorName,
        job: impl Into<String>,
        batch: &RowBatch,
        partition: Option<&PartitionKey>,
    ) -> Self {
        let upper = batch.upper.to_string();
        let mut tags = BTreeMap::new();
        tags.insert(TAG_SENSOR.to_string(), sensor.to_string());
        tags.insert(TAG_ROW_CURSOR.to_string(), upper.clone());
        tags.insert(
            TAG_ROW_LAST_CURSOR.to_string(),
            batch.last.as_ref().map(ToString::to_string).unwrap_or_default(),
        );
        tags.insert(TAG_ROW_COUNT.to_string(), batch.record_count.to_string());
        if let Some(key) = partition {
            tags.insert(TAG_PARTITION_KEY.to_string(), key.to_string());
        }
        Self {
            run_key: format!("{sensor}:{}:{upper}", batch.cursor_column),
            job: job.into(),
            tags,
        }
    }

    /// Request triggered by a schedule tick.
    #[must_use]
    pub fn for_schedule(
        schedule: &str,
        job: impl Into<String>,
        tick: &str,
        partition: Option<&PartitionKey>,
    ) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(TAG_SCHEDULE.to_string(), schedule.to_string());
        if let Some(key) = partition {
            tags.insert(TAG_PARTITION_KEY.to_string(), key.to_string());
        }
        Self {
            run_key: format!("{schedule}:{tick}"),
            job: job.into(),
            tags,
        }
    }

    /// The triggering item, if the request carries one.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata tag is present but malformed.
    pub fn source_item(&self) -> Result<Option<SourceItem>, serde_json::Error> {
        self.tags
            .get(TAG_SOURCE_METADATA)
            .map(|raw| serde_json::from_str(raw))
            .transpose()
    }

    #[must_use]
    pub fn partition_key(&self) -> Option<PartitionKey> {
        self.tags.get(TAG_PARTITION_KEY).map(PartitionKey::new)
    }
}
