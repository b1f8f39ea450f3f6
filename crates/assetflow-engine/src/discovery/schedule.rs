//! Cron schedules as discovery sources: each tick becomes one run request,
//! with the last emitted tick kept as a cursor.

use std::sync::Arc;

use assetflow_state::CursorStore;
use assetflow_types::cursor::CursorValue;
use assetflow_types::run::RunRequest;
use assetflow_types::state::{CursorRecord, SensorName};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use super::sink::RunRequestSink;
use crate::compiler::{CompiledPipeline, CompiledSchedule};
use crate::context::format_instant;
use crate::errors::DiscoveryError;
use crate::partition::PartitionsDef;

pub struct ScheduleEvaluator {
    name: String,
    cursor_name: SensorName,
    job: String,
    schedule: Schedule,
    partitions: Option<PartitionsDef>,
    tags: std::collections::BTreeMap<String, String>,
    store: Arc<dyn CursorStore>,
}

impl std::fmt::Debug for ScheduleEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleEvaluator")
            .field("name", &self.name)
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

impl ScheduleEvaluator {
    /// Evaluator for `schedule`; partitioned jobs take their windows from
    /// the job's first partitioned asset.
    #[must_use]
    pub fn new(
        pipeline: &CompiledPipeline,
        schedule: &CompiledSchedule,
        store: Arc<dyn CursorStore>,
    ) -> Self {
        Self {
            name: schedule.name.clone(),
            cursor_name: SensorName::for_schedule(&schedule.name),
            job: schedule.job.clone(),
            schedule: schedule.schedule.clone(),
            partitions: pipeline.job_partitions(&schedule.job).cloned(),
            tags: schedule.tags.clone(),
            store,
        }
    }

    /// Emit one request for the latest fire time in `(last tick, now]`,
    /// then advance the cursor to it. Ticks missed in between collapse into
    /// that one request. Returns the emitted request, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError`] if the cursor cannot be read or written
    /// or the sink refuses the request; the cursor is then untouched.
    pub async fn evaluate(
        &self,
        now: DateTime<Utc>,
        sink: &dyn RunRequestSink,
    ) -> Result<Option<RunRequest>, DiscoveryError> {
        let Some(tick) = self.schedule.after(&(now + Duration::seconds(1))).next_back() else {
            return Ok(None);
        };

        let store = Arc::clone(&self.store);
        let cursor_name = self.cursor_name.clone();
        let previous = tokio::task::spawn_blocking(move || store.read(&cursor_name, None))
            .await
            .map_err(|e| DiscoveryError::Task(format!("cursor read task failed: {e}")))??;
        if let Some(CursorRecord {
            value: CursorValue::HighWaterMark { value },
            ..
        }) = &previous
        {
            if tick.timestamp() <= *value {
                return Ok(None);
            }
        }

        let partition = self
            .partitions
            .as_ref()
            .and_then(|p| p.last_complete_window(tick))
            .map(|window| window.key);
        let tick_label = format_instant(&tick);
        let mut request =
            RunRequest::for_schedule(&self.name, &self.job, &tick_label, partition.as_ref());
        for (key, value) in &self.tags {
            request.tags.entry(key.clone()).or_insert_with(|| value.clone());
        }

        sink.submit(request.clone())
            .await
            .map_err(|e| DiscoveryError::Sink(e.0))?;

        let store = Arc::clone(&self.store);
        let cursor_name = self.cursor_name.clone();
        let record = CursorRecord {
            value: CursorValue::HighWaterMark {
                value: tick.timestamp(),
            },
            updated_at: format_instant(&now),
        };
        tokio::task::spawn_blocking(move || store.write(&cursor_name, None, &record))
            .await
            .map_err(|e| DiscoveryError::Task(format!("cursor write task failed: {e}")))??;

        tracing::info!(
            schedule = %self.name,
            job = %self.job,
            tick = %tick_label,
            "Schedule fired"
        );
        Ok(Some(request))
    }
}
