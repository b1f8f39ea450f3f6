//! Cursor store trait definition.
//!
//! [`CursorStore`] is the narrow storage contract the discovery engine reads
//! at the start of a poll cycle and writes as the last step of a successful
//! one. Model types live in [`assetflow_types::state`].

use assetflow_types::state::{
    CursorRecord, PartitionKey, RunRecord, RunStats, RunStatus, SensorName,
};

use crate::error;

/// Storage contract for discovery cursors and run bookkeeping.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn CursorStore>`.
/// `write` must be atomic per (sensor, partition) key.
pub trait CursorStore: Send + Sync {
    /// Read the cursor for a (sensor, partition) pair.
    ///
    /// Returns `Ok(None)` when no cursor has been persisted yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn read(
        &self,
        sensor: &SensorName,
        partition: Option<&PartitionKey>,
    ) -> error::Result<Option<CursorRecord>>;

    /// Upsert the cursor for a (sensor, partition) pair.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn write(
        &self,
        sensor: &SensorName,
        partition: Option<&PartitionKey>,
        record: &CursorRecord,
    ) -> error::Result<()>;

    /// Delete the cursor for a (sensor, partition) pair. Returns whether a
    /// cursor existed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn clear(&self, sensor: &SensorName, partition: Option<&PartitionKey>) -> error::Result<bool>;

    /// Record that a run key is being consumed.
    ///
    /// Returns `true` the first time a key is claimed and `false` for every
    /// later claim of the same key (insert-if-absent).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn claim_run_key(&self, run_key: &str) -> error::Result<bool>;

    /// Drop a claim so a failed run can be retried by re-delivery.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn release_run_key(&self, run_key: &str) -> error::Result<()>;

    /// Begin an asset run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, asset: &str, run_key: Option<&str>) -> error::Result<i64>;

    /// Finalize an asset run with status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats)
        -> error::Result<()>;

    /// Most recent runs of `asset`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn recent_runs(&self, asset: &str, limit: usize) -> error::Result<Vec<RunRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn CursorStore`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn CursorStore) {}
    }
}
