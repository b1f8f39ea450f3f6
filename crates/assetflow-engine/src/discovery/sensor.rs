//! One sensor's poll cycle.
//!
//! `IDLE → POLLING → FILTERING → DIFFING → EMITTING → IDLE`, or `FAILED`
//! from any step. The cursor is written only after every request of the
//! cycle has been accepted by the sink, so a cycle that dies part way
//! re-emits the same items next time.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use assetflow_state::CursorStore;
use assetflow_types::cursor::{CursorStrategy, CursorValue};
use assetflow_types::item::SourceItem;
use assetflow_types::run::RunRequest;
use assetflow_types::state::{CursorRecord, PartitionKey, SensorName};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::filter::{list_request, ItemFilter};
use super::sink::RunRequestSink;
use crate::compiler::CompiledSensor;
use crate::connector::{ListRequest, RowQuery, RowSource, SourceConnector};
use crate::context::{format_instant, ContextBuilder, PartitionWindow, TemplateContext};
use crate::errors::DiscoveryError;
use crate::template::{render_value, OperationKind, TemplateFields};

/// Discovery state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorState {
    Idle,
    Polling,
    Filtering,
    Diffing,
    Emitting,
    /// The last cycle failed; the next one starts over from `Idle`.
    Failed,
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Filtering => "filtering",
            Self::Diffing => "diffing",
            Self::Emitting => "emitting",
            Self::Failed => "failed",
        })
    }
}

/// Counters of one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub listed: usize,
    pub matched: usize,
    pub emitted: usize,
    /// Cursor after the cycle.
    pub cursor: Option<CursorValue>,
}

/// Where a sensor's candidates come from.
#[derive(Clone)]
enum Feed {
    /// Paged listing of files or objects, diffed against the cursor here.
    Listing(Arc<dyn SourceConnector>),
    /// Database query, diffed against the cursor in the database.
    Rows(Arc<dyn RowSource>),
}

pub struct SensorCore {
    name: SensorName,
    job: String,
    kind: OperationKind,
    configs: Map<String, Value>,
    strategy: CursorStrategy,
    partition: Option<PartitionKey>,
    page_size: usize,
    context: ContextBuilder,
    feed: Feed,
    store: Arc<dyn CursorStore>,
    state: SensorState,
}

impl fmt::Debug for SensorCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorCore")
            .field("name", &self.name)
            .field("job", &self.job)
            .field("strategy", &self.strategy)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SensorCore {
    /// `context` supplies env, vars and run tags; its instant is replaced
    /// on every cycle.
    #[must_use]
    pub fn new(
        sensor: &CompiledSensor,
        context: ContextBuilder,
        page_size: usize,
        source: Arc<dyn SourceConnector>,
        store: Arc<dyn CursorStore>,
    ) -> Self {
        Self {
            name: SensorName::new(&sensor.name),
            job: sensor.job.clone(),
            kind: sensor.source.operation_kind(),
            configs: sensor.source.configs.clone(),
            strategy: sensor.cursor,
            partition: sensor.partition_key.clone(),
            page_size,
            context: context.run_tags(sensor.tags.clone()),
            feed: Feed::Listing(source),
            store,
            state: SensorState::Idle,
        }
    }

    /// Sensor over a database connection. Its cursor is always
    /// [`CursorStrategy::MaxKey`].
    #[must_use]
    pub fn for_rows(
        sensor: &CompiledSensor,
        context: ContextBuilder,
        source: Arc<dyn RowSource>,
        store: Arc<dyn CursorStore>,
    ) -> Self {
        Self {
            name: SensorName::new(&sensor.name),
            job: sensor.job.clone(),
            kind: sensor.source.operation_kind(),
            configs: sensor.source.configs.clone(),
            strategy: CursorStrategy::MaxKey,
            partition: sensor.partition_key.clone(),
            page_size: 0,
            context: context.run_tags(sensor.tags.clone()),
            feed: Feed::Rows(source),
            store,
            state: SensorState::Idle,
        }
    }

    #[must_use]
    pub fn name(&self) -> &SensorName {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> SensorState {
        self.state
    }

    fn transition(&mut self, next: SensorState) {
        tracing::debug!(sensor = %self.name, from = %self.state, to = %next, "Sensor state");
        self.state = next;
    }

    /// Run one full cycle against `sink`.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError`]; the cursor is untouched and the state
    /// is [`SensorState::Failed`].
    pub async fn run_cycle(
        &mut self,
        sink: &dyn RunRequestSink,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, DiscoveryError> {
        match self.cycle(sink, now).await {
            Ok(outcome) => {
                self.transition(SensorState::Idle);
                tracing::info!(
                    sensor = %self.name,
                    listed = outcome.listed,
                    matched = outcome.matched,
                    emitted = outcome.emitted,
                    "Discovery cycle complete"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.transition(SensorState::Failed);
                Err(err)
            }
        }
    }

    async fn cycle(
        &mut self,
        sink: &dyn RunRequestSink,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, DiscoveryError> {
        self.transition(SensorState::Polling);

        let ctx = self
            .context
            .clone()
            .at(now)
            .partition(self.partition.clone().map(PartitionWindow::key_only))
            .build();
        let field_path = format!("sensors.{}", self.name);
        let rendered = match render_value(
            &Value::Object(self.configs.clone()),
            &ctx,
            self.kind,
            TemplateFields::standard(),
            &field_path,
        )? {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        match self.feed.clone() {
            Feed::Listing(source) => {
                let filter = ItemFilter::from_configs(&rendered, self.kind, &field_path)?;
                let request = list_request(&rendered, self.kind, self.page_size)?;
                let previous = self.read_cursor().await?;
                self.list_cycle(&source, &request, &filter, &ctx, sink, previous, now)
                    .await
            }
            Feed::Rows(source) => {
                let query = RowQuery::from_configs(&rendered)
                    .map_err(|e| DiscoveryError::Config(format!("{field_path}: {e}")))?;
                let previous = self.read_cursor().await?;
                self.row_cycle(source, query, sink, previous, now).await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn list_cycle(
        &mut self,
        source: &Arc<dyn SourceConnector>,
        request: &ListRequest,
        filter: &ItemFilter,
        ctx: &TemplateContext,
        sink: &dyn RunRequestSink,
        previous: Option<CursorValue>,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, DiscoveryError> {
        let mut outcome = CycleOutcome::default();
        let mut matched: Vec<SourceItem> = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            self.transition(SensorState::Polling);
            let source = Arc::clone(source);
            let req = request.clone();
            let token = continuation.take();
            let page = tokio::task::spawn_blocking(move || source.list_page(&req, token.as_deref()))
                .await
                .map_err(|e| DiscoveryError::Task(format!("listing task failed: {e}")))?
                .map_err(DiscoveryError::from_connector)?;

            self.transition(SensorState::Filtering);
            outcome.listed += page.items.len();
            for item in page.items {
                if filter.matches(&item, ctx)? {
                    matched.push(item);
                }
            }

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        outcome.matched = matched.len();

        self.transition(SensorState::Diffing);
        let still_listed: BTreeSet<String> = matched.iter().map(SourceItem::identity).collect();
        let mut fresh: Vec<SourceItem> = matched
            .into_iter()
            .filter(|item| previous.as_ref().map_or(true, |cursor| cursor.admits(item)))
            .collect();
        fresh.sort_by(SourceItem::discovery_cmp);

        self.transition(SensorState::Emitting);
        for item in &fresh {
            let request = RunRequest::for_item(&self.name, &self.job, item, self.partition.as_ref())
                .map_err(|e| DiscoveryError::Config(format!("cannot encode source item: {e}")))?;
            tracing::debug!(
                sensor = %self.name,
                run_key = %request.run_key,
                "Emitting run request"
            );
            sink.submit(request)
                .await
                .map_err(|e| DiscoveryError::Sink(e.0))?;
        }
        outcome.emitted = fresh.len();

        let next = self.strategy.advance(previous.as_ref(), &fresh, &still_listed);
        self.commit_cursor(previous.as_ref(), next.as_ref(), now).await?;
        outcome.cursor = next;
        Ok(outcome)
    }

    /// Poll a row source once; new rows become a single request covering
    /// the whole window.
    async fn row_cycle(
        &mut self,
        source: Arc<dyn RowSource>,
        query: RowQuery,
        sink: &dyn RunRequestSink,
        previous: Option<CursorValue>,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, DiscoveryError> {
        let after = previous.as_ref().and_then(CursorValue::row_key).cloned();
        let batch = tokio::task::spawn_blocking(move || source.next_batch(&query, after.as_ref()))
            .await
            .map_err(|e| DiscoveryError::Task(format!("row poll task failed: {e}")))?
            .map_err(DiscoveryError::from_connector)?;

        self.transition(SensorState::Diffing);
        let mut outcome = CycleOutcome::default();
        if let Some(batch) = &batch {
            outcome.listed = usize::try_from(batch.record_count).unwrap_or(usize::MAX);
            outcome.matched = outcome.listed;

            self.transition(SensorState::Emitting);
            let request =
                RunRequest::for_rows(&self.name, &self.job, batch, self.partition.as_ref());
            tracing::debug!(
                sensor = %self.name,
                run_key = %request.run_key,
                rows = batch.record_count,
                "Emitting row window"
            );
            sink.submit(request)
                .await
                .map_err(|e| DiscoveryError::Sink(e.0))?;
            outcome.emitted = 1;
        }

        let next = CursorStrategy::advance_rows(previous.as_ref(), batch.as_ref());
        self.commit_cursor(previous.as_ref(), next.as_ref(), now).await?;
        outcome.cursor = next;
        Ok(outcome)
    }

    async fn commit_cursor(
        &self,
        previous: Option<&CursorValue>,
        next: Option<&CursorValue>,
        now: DateTime<Utc>,
    ) -> Result<(), DiscoveryError> {
        match next {
            Some(value) if Some(value) != previous => self.write_cursor(value.clone(), now).await,
            _ => Ok(()),
        }
    }

    async fn read_cursor(&self) -> Result<Option<CursorValue>, DiscoveryError> {
        let store = Arc::clone(&self.store);
        let name = self.name.clone();
        let partition = self.partition.clone();
        let record = tokio::task::spawn_blocking(move || store.read(&name, partition.as_ref()))
            .await
            .map_err(|e| DiscoveryError::Task(format!("cursor read task failed: {e}")))??;

        Ok(record.and_then(|record| {
            if record.value.strategy() == self.strategy {
                Some(record.value)
            } else {
                tracing::warn!(
                    sensor = %self.name,
                    stored = ?record.value.strategy(),
                    configured = ?self.strategy,
                    "Stored cursor uses a different strategy; starting from scratch"
                );
                None
            }
        }))
    }

    async fn write_cursor(
        &self,
        value: CursorValue,
        now: DateTime<Utc>,
    ) -> Result<(), DiscoveryError> {
        let store = Arc::clone(&self.store);
        let name = self.name.clone();
        let partition = self.partition.clone();
        let record = CursorRecord {
            value,
            updated_at: format_instant(&now),
        };
        tokio::task::spawn_blocking(move || store.write(&name, partition.as_ref(), &record))
            .await
            .map_err(|e| DiscoveryError::Task(format!("cursor write task failed: {e}")))??;
        Ok(())
    }
}
