pub mod check;
pub mod cursor;
pub mod history;
pub mod run;
pub mod sense;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use assetflow_engine::config::parser::active_environment;
use assetflow_engine::connector::ConnectorRegistry;
use assetflow_engine::transfer::{ConcurrencyPools, TransferEngine};
use assetflow_engine::{load_pipeline, CompiledPipeline, Materializer};
use assetflow_state::{CursorStore, SqliteCursorStore};
use tokio_util::sync::CancellationToken;

/// Everything a command needs for one pipeline file.
pub struct Workspace {
    pub pipeline: Arc<CompiledPipeline>,
    pub store: Arc<dyn CursorStore>,
    pub registry: Arc<ConnectorRegistry>,
}

impl Workspace {
    /// Compile `path` for the active environment and open its state store.
    pub fn open(path: &Path, environment: Option<&str>) -> Result<Self> {
        let environment = active_environment(environment);
        let pipeline = load_pipeline(path, &environment)?;
        let state_path = pipeline.state.resolve_path();
        let store = SqliteCursorStore::open(&state_path)
            .with_context(|| format!("Failed to open state store {}", state_path.display()))?;

        tracing::debug!(
            pipeline = pipeline.name,
            environment,
            state = %state_path.display(),
            "Pipeline loaded"
        );

        Ok(Self {
            pipeline: Arc::new(pipeline),
            store: Arc::new(store),
            registry: Arc::new(ConnectorRegistry::with_builtins()),
        })
    }

    /// Materializer whose transfers stop when `cancel` fires.
    pub fn materializer(&self, cancel: CancellationToken) -> Materializer {
        let resources = &self.pipeline.resources;
        let engine = TransferEngine::new(
            Arc::new(ConcurrencyPools::from_settings(resources)),
            resources.transfer.clone(),
            cancel,
        );
        Materializer::new(
            Arc::clone(&self.pipeline),
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::new(engine),
        )
    }
}

/// Cancel `token` on Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            token.cancel();
        }
    });
}
