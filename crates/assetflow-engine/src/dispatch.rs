//! Idempotent consumption of run requests.
//!
//! Each request's run key is claimed in the cursor store before the job
//! runs; a key that was already claimed is a re-delivery and is skipped.
//! Failed runs release their claim so a later delivery can retry them.

use std::sync::Arc;

use assetflow_types::run::RunRequest;
use assetflow_types::state::RunStatus;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::TransferError;
use crate::materialize::{MaterializeRequest, Materializer};
use crate::result::TransferResult;

/// What happened to one delivered request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The run key was already claimed.
    Duplicate,
    /// One result per asset of the job, in job order.
    Completed(Vec<TransferResult>),
}

/// Totals of a [`Dispatcher::run`] loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub completed: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Executes the job named by each run request.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    materializer: Arc<Materializer>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(materializer: Arc<Materializer>) -> Self {
        Self { materializer }
    }

    /// Claim `request` and run its job's assets in order.
    ///
    /// # Errors
    ///
    /// Returns the first asset's [`TransferError`]; the claim is released
    /// first.
    pub async fn dispatch(&self, request: &RunRequest) -> Result<DispatchOutcome, TransferError> {
        if !self.claim(&request.run_key).await? {
            tracing::info!(
                run_key = %request.run_key,
                job = %request.job,
                "Duplicate run request skipped"
            );
            return Ok(DispatchOutcome::Duplicate);
        }

        match self.run_job(request).await {
            Ok(results) => {
                if results
                    .iter()
                    .any(|r| matches!(r.status(), RunStatus::Failed | RunStatus::Cancelled))
                {
                    self.release(&request.run_key).await?;
                }
                Ok(DispatchOutcome::Completed(results))
            }
            Err(err) => {
                if let Err(release_err) = self.release(&request.run_key).await {
                    tracing::error!(
                        run_key = %request.run_key,
                        error = %release_err,
                        "Failed to release run key"
                    );
                }
                Err(err)
            }
        }
    }

    /// Dispatch requests from `rx` one at a time until the channel closes
    /// or `cancel` fires.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<RunRequest>,
        cancel: CancellationToken,
    ) -> DispatchStats {
        let mut stats = DispatchStats::default();
        loop {
            let request = tokio::select! {
                () = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };
            match self.dispatch(&request).await {
                Ok(DispatchOutcome::Duplicate) => stats.duplicates += 1,
                Ok(DispatchOutcome::Completed(_)) => stats.completed += 1,
                Err(err) => {
                    tracing::error!(
                        run_key = %request.run_key,
                        job = %request.job,
                        error = %err,
                        "Run failed"
                    );
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    async fn run_job(&self, request: &RunRequest) -> Result<Vec<TransferResult>, TransferError> {
        let job = self
            .materializer
            .pipeline()
            .jobs
            .get(&request.job)
            .ok_or_else(|| TransferError::Config(format!("unknown job '{}'", request.job)))?
            .clone();

        let mut results = Vec::with_capacity(job.assets.len());
        for asset in &job.assets {
            let materialize = MaterializeRequest::from_run_request(asset, request)?;
            results.push(self.materializer.materialize(&materialize).await?);
        }
        Ok(results)
    }

    async fn claim(&self, run_key: &str) -> Result<bool, TransferError> {
        let store = Arc::clone(self.materializer.store());
        let key = run_key.to_string();
        Ok(tokio::task::spawn_blocking(move || store.claim_run_key(&key))
            .await
            .map_err(|e| TransferError::Task(format!("run key claim failed: {e}")))??)
    }

    async fn release(&self, run_key: &str) -> Result<(), TransferError> {
        let store = Arc::clone(self.materializer.store());
        let key = run_key.to_string();
        tokio::task::spawn_blocking(move || store.release_run_key(&key))
            .await
            .map_err(|e| TransferError::Task(format!("run key release failed: {e}")))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::compiler::compile_with;
    use crate::config::parser::parse_pipeline_str;
    use crate::connector::ConnectorRegistry;
    use crate::transfer::{ConcurrencyPools, TransferEngine, TransferSettings};
    use assetflow_state::{CursorStore, SqliteCursorStore};
    use assetflow_types::item::{FileMeta, SourceItem};
    use assetflow_types::state::SensorName;

    fn dispatcher(root: &Path) -> (Dispatcher, Arc<SqliteCursorStore>) {
        let yaml = format!(
            r#"
pipeline: p
connections:
  common:
    files: {{type: local, root_dir: "{}"}}
assets:
  - name: copy
    source: {{connection: files, configs: {{path: /in}}}}
    target: {{connection: files, configs: {{path: /out}}}}
jobs:
  - name: ingest
    selection: "*"
"#,
            root.display()
        );
        let def = parse_pipeline_str(&yaml).unwrap();
        let pipeline = Arc::new(compile_with(&def, "dev", &|_| None).unwrap());
        let store = Arc::new(SqliteCursorStore::in_memory().unwrap());
        let engine = Arc::new(TransferEngine::new(
            Arc::new(ConcurrencyPools::from_settings(&pipeline.resources)),
            TransferSettings::default(),
            CancellationToken::new(),
        ));
        let materializer = Materializer::new(
            pipeline,
            Arc::new(ConnectorRegistry::with_builtins()),
            store.clone(),
            engine,
        )
        .with_env(BTreeMap::new());
        (Dispatcher::new(Arc::new(materializer)), store)
    }

    fn request_for(name: &str) -> RunRequest {
        let item: SourceItem = FileMeta::new(name, format!("/in/{name}"), 1, 0).into();
        RunRequest::for_item(&SensorName::new("landing"), "ingest", &item, None).unwrap()
    }

    fn seed(root: &Path, name: &str) {
        let path = root.join("in").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "x").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(600))
            .unwrap();
    }

    #[tokio::test]
    async fn redelivery_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "a.csv");
        let (dispatcher, _) = dispatcher(dir.path());
        let request = request_for("a.csv");

        let first = dispatcher.dispatch(&request).await.unwrap();
        assert!(matches!(first, DispatchOutcome::Completed(ref results) if results.len() == 1));
        let second = dispatcher.dispatch(&request).await.unwrap();
        assert!(matches!(second, DispatchOutcome::Duplicate));
    }

    #[tokio::test]
    async fn failed_run_releases_its_claim() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, store) = dispatcher(dir.path());
        let request = request_for("late.csv");

        assert!(dispatcher.dispatch(&request).await.is_err());
        assert!(store.claim_run_key(&request.run_key).unwrap(), "claim was released");
    }

    #[tokio::test]
    async fn unknown_job_fails_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, store) = dispatcher(dir.path());
        let mut request = request_for("a.csv");
        request.job = "missing".into();

        let err = dispatcher.dispatch(&request).await.unwrap_err();
        assert!(err.to_string().contains("unknown job"));
        assert!(store.claim_run_key(&request.run_key).unwrap());
    }

    #[tokio::test]
    async fn run_loop_counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "a.csv");
        let (dispatcher, _) = dispatcher(dir.path());
        let (tx, rx) = mpsc::channel(8);
        tx.send(request_for("a.csv")).await.unwrap();
        tx.send(request_for("a.csv")).await.unwrap();
        tx.send(request_for("missing.csv")).await.unwrap();
        drop(tx);

        let stats = dispatcher.run(rx, CancellationToken::new()).await;
        assert_eq!(
            stats,
            DispatchStats {
                completed: 1,
                duplicates: 1,
                failed: 1
            }
        );
        assert!(dir.path().join("out/a.csv").exists());
    }
}
