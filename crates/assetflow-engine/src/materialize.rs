//! Materialization of one asset: run-wide context, connectors, run history,
//! then the transfer itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use assetflow_state::CursorStore;
use assetflow_types::item::SourceItem;
use assetflow_types::run::RunRequest;
use assetflow_types::state::{PartitionKey, RunStats, RunStatus};
use chrono::Utc;

use crate::compiler::{CompiledAsset, CompiledPipeline};
use crate::connector::ConnectorRegistry;
use crate::context::{ContextBuilder, PartitionWindow, TemplateContext};
use crate::errors::TransferError;
use crate::result::TransferResult;
use crate::transfer::{TransferEngine, TransferMode, TransferPlan};

/// What to materialize and why.
#[derive(Debug, Clone, Default)]
pub struct MaterializeRequest {
    pub asset: String,
    pub partition: Option<PartitionKey>,
    /// Key of the triggering run request, kept in run history.
    pub run_key: Option<String>,
    /// Exposed to templates as `run_tags`.
    pub tags: BTreeMap<String, String>,
    /// Present for item-triggered runs, which then move only this item.
    pub item: Option<SourceItem>,
}

impl MaterializeRequest {
    /// Discovery-and-stream run of `asset`.
    #[must_use]
    pub fn asset(name: impl Into<String>) -> Self {
        Self {
            asset: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_partition(mut self, key: Option<PartitionKey>) -> Self {
        self.partition = key;
        self
    }

    /// Run of `asset` triggered by `request`. The triggering item is
    /// hydrated from the request's metadata tag.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Config`] when the item metadata is malformed.
    pub fn from_run_request(asset: &str, request: &RunRequest) -> Result<Self, TransferError> {
        let item = request.source_item().map_err(|e| {
            TransferError::Config(format!(
                "run request {} carries malformed item metadata: {e}",
                request.run_key
            ))
        })?;
        Ok(Self {
            asset: asset.to_string(),
            partition: request.partition_key(),
            run_key: Some(request.run_key.clone()),
            tags: request.tags.clone(),
            item,
        })
    }
}

/// Runs assets of one compiled pipeline.
pub struct Materializer {
    pipeline: Arc<CompiledPipeline>,
    registry: Arc<ConnectorRegistry>,
    store: Arc<dyn CursorStore>,
    engine: Arc<TransferEngine>,
    env: BTreeMap<String, String>,
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("pipeline", &self.pipeline.name)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Materializer {
    /// Templates see a snapshot of the process environment as `env`.
    #[must_use]
    pub fn new(
        pipeline: Arc<CompiledPipeline>,
        registry: Arc<ConnectorRegistry>,
        store: Arc<dyn CursorStore>,
        engine: Arc<TransferEngine>,
    ) -> Self {
        Self {
            pipeline,
            registry,
            store,
            engine,
            env: std::env::vars().collect(),
        }
    }

    /// Replace the environment seen by templates.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<CompiledPipeline> {
        &self.pipeline
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CursorStore> {
        &self.store
    }

    /// Run-wide context for `asset`. The partition window is computed once
    /// here and shared by every item of the run.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Config`] when the partition key does not
    /// belong to the asset's partitions.
    pub fn context_for(
        &self,
        asset: &CompiledAsset,
        request: &MaterializeRequest,
    ) -> Result<TemplateContext, TransferError> {
        let window = match (&request.partition, &asset.partitions) {
            (Some(key), Some(partitions)) => Some(
                partitions
                    .window_for_key(key)
                    .map_err(|e| TransferError::Config(format!("asset '{}': {e}", asset.name)))?,
            ),
            (Some(key), None) => Some(PartitionWindow::key_only(key.clone())),
            (None, _) => None,
        };
        Ok(ContextBuilder::new(Utc::now())
            .env(self.env.clone())
            .vars(self.pipeline.vars.clone())
            .run_tags(request.tags.clone())
            .partition(window)
            .build())
    }

    /// Bind `asset` to connectors from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Config`] when a connection has no backend.
    pub fn plan(&self, asset: &CompiledAsset) -> Result<TransferPlan, TransferError> {
        let spec = |name: &str| {
            self.pipeline
                .connections
                .get(name)
                .ok_or_else(|| TransferError::Config(format!("unknown connection '{name}'")))
        };
        let source = self
            .registry
            .source(spec(&asset.source.connection)?)
            .map_err(|e| {
                TransferError::Config(format!("source '{}': {e}", asset.source.connection))
            })?;
        let target = self
            .registry
            .target(spec(&asset.target.connection)?)
            .map_err(|e| {
                TransferError::Config(format!("target '{}': {e}", asset.target.connection))
            })?;
        Ok(TransferPlan::for_asset(
            asset,
            source,
            target,
            self.pipeline.resources.page_size,
        ))
    }

    /// Materialize one asset and record the run in history.
    ///
    /// Requests carrying an item run in single-unit mode; the rest list the
    /// source themselves.
    ///
    /// # Errors
    ///
    /// Returns the [`TransferError`] that failed the run, after recording
    /// it; a run with some failed items is `Ok` with a partial result.
    pub async fn materialize(
        &self,
        request: &MaterializeRequest,
    ) -> Result<TransferResult, TransferError> {
        let asset = self
            .pipeline
            .assets
            .get(&request.asset)
            .ok_or_else(|| TransferError::Config(format!("unknown asset '{}'", request.asset)))?;
        let ctx = self.context_for(asset, request)?;
        let plan = self.plan(asset)?;

        let store = Arc::clone(&self.store);
        let name = asset.name.clone();
        let run_key = request.run_key.clone();
        let run_id = tokio::task::spawn_blocking(move || store.start_run(&name, run_key.as_deref()))
            .await
            .map_err(|e| TransferError::Task(format!("run history task failed: {e}")))??;

        let mode = request
            .item
            .clone()
            .map_or(TransferMode::Discover, TransferMode::Single);
        let outcome = self.engine.execute(&plan, &ctx, mode).await;

        let (status, stats) = match &outcome {
            Ok(result) => (result.status(), result.to_run_stats()),
            Err(err) => {
                let status = if matches!(err, TransferError::Cancelled) {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                let stats = RunStats {
                    items_failed: u64::from(matches!(err, TransferError::Item(_))),
                    error_message: Some(err.to_string()),
                    ..RunStats::default()
                };
                (status, stats)
            }
        };
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.complete_run(run_id, status, &stats))
            .await
            .map_err(|e| TransferError::Task(format!("run history task failed: {e}")))??;

        tracing::info!(asset = %asset.name, run_id, status = %status, "Materialization recorded");
        outcome
    }
}
