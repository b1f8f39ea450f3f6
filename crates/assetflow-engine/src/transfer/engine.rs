//! Asset execution in single-unit and discovery-and-stream modes.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use assetflow_types::error::ConnectorError;
use assetflow_types::item::SourceItem;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::guard::{check_is_modifying, SkipReason};
use super::pools::ConcurrencyPools;
use super::progress::{ProgressBasis, ProgressObserver, ProgressTracker};
use super::stream::{copy_item, CopyError};
use super::target::resolve_location;
use super::TransferSettings;
use crate::compiler::{CompiledAsset, EndpointSpec};
use crate::connector::{ListRequest, SourceConnector, TargetConnector, TargetLocation};
use crate::context::TemplateContext;
use crate::discovery::filter::{list_request, ItemFilter};
use crate::errors::{ItemFailure, TransferError, TransferItemError};
use crate::result::{SkippedItem, TransferResult};
use crate::template::{render_value, TemplateFields};

const SOURCE_FIELD: &str = "source";

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One asset bound to live connectors.
#[derive(Clone)]
pub struct TransferPlan {
    pub asset: String,
    pub source_spec: EndpointSpec,
    pub target_spec: EndpointSpec,
    pub source: Arc<dyn SourceConnector>,
    pub target: Arc<dyn TargetConnector>,
    pub concurrency_key: String,
    /// Worker cap inside this run, on top of the shared pool.
    pub max_workers: usize,
    pub check_is_modifying: bool,
    pub page_size: usize,
}

impl std::fmt::Debug for TransferPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferPlan")
            .field("asset", &self.asset)
            .field("source", &self.source_spec.connection)
            .field("target", &self.target_spec.connection)
            .field("concurrency_key", &self.concurrency_key)
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}

impl TransferPlan {
    #[must_use]
    pub fn for_asset(
        asset: &CompiledAsset,
        source: Arc<dyn SourceConnector>,
        target: Arc<dyn TargetConnector>,
        page_size: usize,
    ) -> Self {
        Self {
            asset: asset.name.clone(),
            source_spec: asset.source.clone(),
            target_spec: asset.target.clone(),
            source,
            target,
            concurrency_key: asset.concurrency_key.clone(),
            max_workers: asset.max_workers,
            check_is_modifying: asset.check_is_modifying,
            page_size,
        }
    }
}

/// How the items of a run are chosen.
#[derive(Debug, Clone)]
pub enum TransferMode {
    /// Move exactly this item; its failure fails the run.
    Single(SourceItem),
    /// List the source, filter, and move every match.
    Discover,
}

// ---------------------------------------------------------------------------
// Per-item work
// ---------------------------------------------------------------------------

enum ItemOutcome {
    Moved(u64),
    Skipped(SkipReason),
    Cancelled,
}

/// Blocking half of an item transfer, shared by the workers of one run.
struct Worker {
    source: Arc<dyn SourceConnector>,
    target: Arc<dyn TargetConnector>,
    settings: TransferSettings,
    check_is_modifying: bool,
    cancel: CancellationToken,
    tracker: Arc<Mutex<ProgressTracker>>,
    /// Single-unit runs measure progress in bytes, others in items.
    track_bytes: bool,
}

impl Worker {
    fn transfer(
        &self,
        item: &SourceItem,
        location: &TargetLocation,
    ) -> Result<ItemOutcome, ItemFailure> {
        if self.check_is_modifying {
            let current = self.source.stat(item)?;
            if let Some(reason) =
                check_is_modifying(item, &current, Utc::now(), self.settings.modifying_grace)
            {
                return Ok(ItemOutcome::Skipped(reason));
            }
        }

        let mut reader = self.source.open(item)?;
        let mut writer = self.target.open_writer(location)?;
        let copied = copy_item(
            &mut reader,
            &mut writer,
            item.size(),
            &self.settings,
            &self.cancel,
            &mut |n| {
                if self.track_bytes {
                    self.tracker
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record_bytes(n);
                }
            },
        );

        match copied {
            Ok(bytes) => {
                writer.commit()?;
                Ok(ItemOutcome::Moved(bytes))
            }
            Err(CopyError::Cancelled) => {
                writer.abort();
                Ok(ItemOutcome::Cancelled)
            }
            Err(CopyError::Read(e)) => {
                writer.abort();
                Err(ConnectorError::from_io("READ_FAILED", &e).into())
            }
            Err(CopyError::Write(e)) => {
                writer.abort();
                Err(ConnectorError::from_io("WRITE_FAILED", &e).into())
            }
        }
    }

    fn item_done(&self) {
        if !self.track_bytes {
            self.tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record_item();
        }
    }
}

fn record(result: &mut TransferResult, item: String, outcome: Result<ItemOutcome, ItemFailure>) {
    match outcome {
        Ok(ItemOutcome::Moved(bytes)) => {
            tracing::debug!(asset = %result.asset, item = %item, bytes, "Item transferred");
            result.bytes += bytes;
            result.succeeded.push(item);
        }
        Ok(ItemOutcome::Skipped(reason)) => {
            tracing::info!(asset = %result.asset, item = %item, reason = %reason, "Item skipped");
            result.skipped.push(SkippedItem { item, reason });
        }
        Ok(ItemOutcome::Cancelled) => {
            tracing::warn!(asset = %result.asset, item = %item, "Item transfer cancelled");
            result.cancelled = true;
        }
        Err(error) => {
            tracing::warn!(
                asset = %result.asset,
                item = %item,
                error = %error,
                "Item transfer failed"
            );
            result.failed.push(TransferItemError { item, error });
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Executes transfer plans against shared concurrency pools.
pub struct TransferEngine {
    pools: Arc<ConcurrencyPools>,
    settings: TransferSettings,
    cancel: CancellationToken,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("settings", &self.settings)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl TransferEngine {
    #[must_use]
    pub fn new(
        pools: Arc<ConcurrencyPools>,
        settings: TransferSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pools,
            settings,
            cancel,
            observer: None,
        }
    }

    /// Forward progress milestones to `observer` as well as the log.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn pools(&self) -> &Arc<ConcurrencyPools> {
        &self.pools
    }

    #[must_use]
    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Token that stops new items and chunks when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `plan` with the run-wide context `ctx`.
    ///
    /// In discovery mode a failing item is recorded and its siblings carry
    /// on; the result then reports `Partial` or `Failed`. In single mode the
    /// item's failure is the run's failure.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] for configuration and template problems,
    /// a failed listing, the single item's failure, or cancellation before
    /// any item started.
    pub async fn execute(
        &self,
        plan: &TransferPlan,
        ctx: &TemplateContext,
        mode: TransferMode,
    ) -> Result<TransferResult, TransferError> {
        let started = Instant::now();
        let mode_name = match mode {
            TransferMode::Single(_) => "single",
            TransferMode::Discover => "discover",
        };
        tracing::info!(
            asset = %plan.asset,
            mode = mode_name,
            concurrency_key = %plan.concurrency_key,
            "Starting transfer"
        );

        let mut result = match mode {
            TransferMode::Single(item) => self.execute_single(plan, ctx, item).await?,
            TransferMode::Discover => self.execute_discover(plan, ctx).await?,
        };
        result.duration = started.elapsed();

        tracing::info!(
            asset = %plan.asset,
            status = %result.status(),
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            bytes = result.bytes,
            duration_secs = result.duration.as_secs_f64(),
            "Transfer finished"
        );
        Ok(result)
    }

    async fn execute_single(
        &self,
        plan: &TransferPlan,
        ctx: &TemplateContext,
        item: SourceItem,
    ) -> Result<TransferResult, TransferError> {
        let item_ctx = ctx.with_item(&item);
        let (_, filter) = source_filter(&plan.source_spec, &item_ctx)?;
        let identity = item.identity();
        let mut result = TransferResult::new(&plan.asset);
        let fail = |error: ItemFailure| {
            tracing::error!(
                asset = %plan.asset,
                item = %identity,
                error = %error,
                "Item transfer failed"
            );
            TransferError::Item(TransferItemError::new(identity.clone(), error))
        };

        if !filter.matches(&item, ctx).map_err(|e| fail(e.into()))? {
            record(&mut result, identity.clone(), Ok(ItemOutcome::Skipped(SkipReason::Filtered)));
            return Ok(result);
        }
        let location = resolve_location(&plan.target_spec, &item_ctx, Some(&item)).map_err(fail)?;

        let tracker = self.tracker(&plan.asset, ProgressBasis::Bytes(item.size()), 1);
        let worker = self.worker(plan, tracker, true);
        let pool = self.pools.pool(&plan.concurrency_key);
        let Some(permit) = self.acquire(&pool).await? else {
            result.cancelled = true;
            return Ok(result);
        };
        let outcome = tokio::task::spawn_blocking(move || worker.transfer(&item, &location))
            .await
            .map_err(|e| TransferError::Task(format!("transfer of {identity} failed: {e}")))?;
        drop(permit);

        let outcome = outcome.map_err(fail)?;
        record(&mut result, identity.clone(), Ok(outcome));
        Ok(result)
    }

    async fn execute_discover(
        &self,
        plan: &TransferPlan,
        ctx: &TemplateContext,
    ) -> Result<TransferResult, TransferError> {
        let (rendered, filter) = source_filter(&plan.source_spec, ctx)?;
        let request = list_request(&rendered, plan.source_spec.operation_kind(), plan.page_size)?;
        let mut result = TransferResult::new(&plan.asset);
        let mut candidates = self
            .list_candidates(plan, &request, &filter, ctx, &mut result)
            .await?;
        candidates.sort_by(SourceItem::discovery_cmp);
        let total = candidates.len() as u64;
        tracing::info!(
            asset = %plan.asset,
            items = total,
            max_workers = plan.max_workers,
            "Transferring discovered items"
        );

        let tracker = self.tracker(&plan.asset, ProgressBasis::Items(total), total);
        let worker = Arc::new(self.worker(plan, tracker, false));
        let workers = Arc::new(Semaphore::new(plan.max_workers.max(1)));
        let pool = self.pools.pool(&plan.concurrency_key);
        let mut join_set: JoinSet<(String, Result<ItemOutcome, ItemFailure>)> = JoinSet::new();

        for item in candidates {
            let identity = item.identity();
            let item_ctx = ctx.with_item(&item);
            let location = match resolve_location(&plan.target_spec, &item_ctx, Some(&item)) {
                Ok(location) => location,
                Err(error) => {
                    worker.item_done();
                    record(&mut result, identity, Err(error));
                    continue;
                }
            };

            let Some(worker_permit) = self.acquire(&workers).await? else {
                result.cancelled = true;
                break;
            };
            let Some(pool_permit) = self.acquire(&pool).await? else {
                result.cancelled = true;
                break;
            };

            let worker = Arc::clone(&worker);
            join_set.spawn(async move {
                let _permits = (worker_permit, pool_permit);
                let task_worker = Arc::clone(&worker);
                let outcome =
                    tokio::task::spawn_blocking(move || task_worker.transfer(&item, &location))
                        .await
                    .unwrap_or_else(|e| Err(ItemFailure::Worker(e.to_string())));
                worker.item_done();
                (identity, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((identity, outcome)) => record(&mut result, identity, outcome),
                Err(e) => {
                    tracing::error!(asset = %plan.asset, error = %e, "Transfer worker panicked");
                }
            }
        }

        result.succeeded.sort();
        result.failed.sort_by(|a, b| a.item.cmp(&b.item));
        Ok(result)
    }

    /// List every page, keeping only items that pass `filter`. Pattern
    /// misses are dropped per page; predicate rejections and failures are
    /// recorded on `result`.
    async fn list_candidates(
        &self,
        plan: &TransferPlan,
        request: &ListRequest,
        filter: &ItemFilter,
        ctx: &TemplateContext,
        result: &mut TransferResult,
    ) -> Result<Vec<SourceItem>, TransferError> {
        let mut items = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let source = Arc::clone(&plan.source);
            let req = request.clone();
            let token = continuation.take();
            let page = tokio::task::spawn_blocking(move || source.list_page(&req, token.as_deref()))
                .await
                .map_err(|e| TransferError::Task(format!("listing task failed: {e}")))?
                .map_err(TransferError::Listing)?;
            for item in page.items.into_iter().filter(|item| filter.matches_pattern(item)) {
                match filter.accepts(&item, ctx) {
                    Ok(true) => items.push(item),
                    Ok(false) => record(
                        result,
                        item.identity(),
                        Ok(ItemOutcome::Skipped(SkipReason::Filtered)),
                    ),
                    Err(e) => record(result, item.identity(), Err(e.into())),
                }
            }
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        Ok(items)
    }

    /// Wait for a slot, giving up when the run is cancelled.
    async fn acquire(
        &self,
        semaphore: &Arc<Semaphore>,
    ) -> Result<Option<OwnedSemaphorePermit>, TransferError> {
        tokio::select! {
            () = self.cancel.cancelled() => Ok(None),
            permit = Arc::clone(semaphore).acquire_owned() => permit
                .map(Some)
                .map_err(|e| TransferError::Task(format!("semaphore closed: {e}"))),
        }
    }

    fn tracker(
        &self,
        asset: &str,
        basis: ProgressBasis,
        items_total: u64,
    ) -> Arc<Mutex<ProgressTracker>> {
        Arc::new(Mutex::new(
            ProgressTracker::new(asset, basis, items_total, self.settings.progress_step_percent)
                .with_observer(self.observer.clone()),
        ))
    }

    fn worker(
        &self,
        plan: &TransferPlan,
        tracker: Arc<Mutex<ProgressTracker>>,
        track_bytes: bool,
    ) -> Worker {
        Worker {
            source: Arc::clone(&plan.source),
            target: Arc::clone(&plan.target),
            settings: self.settings.clone(),
            check_is_modifying: plan.check_is_modifying,
            cancel: self.cancel.clone(),
            tracker,
            track_bytes,
        }
    }
}

/// Render the source configs and build the asset's own filter from them.
fn source_filter(
    source: &EndpointSpec,
    ctx: &TemplateContext,
) -> Result<(Map<String, Value>, ItemFilter), TransferError> {
    let kind = source.operation_kind();
    let rendered = match render_value(
        &Value::Object(source.configs.clone()),
        ctx,
        kind,
        TemplateFields::standard(),
        SOURCE_FIELD,
    )? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let filter = ItemFilter::from_configs(&rendered, kind, SOURCE_FIELD)?;
    Ok((rendered, filter))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::config::types::ConnectionKind;
    use crate::connector::{LocalFileSource, LocalFileTarget};
    use crate::context::ContextBuilder;
    use assetflow_types::item::FileMeta;
    use assetflow_types::state::RunStatus;
    use serde_json::json;

    fn endpoint(kind: ConnectionKind, configs: Value) -> EndpointSpec {
        let Value::Object(configs) = configs else { unreachable!() };
        EndpointSpec {
            connection: "c".into(),
            kind,
            configs,
        }
    }

    fn write_old(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(old)
            .unwrap();
    }

    fn plan(root: &Path, source: Value, check_is_modifying: bool) -> TransferPlan {
        TransferPlan {
            asset: "copy".into(),
            source_spec: endpoint(ConnectionKind::Local, source),
            target_spec: endpoint(ConnectionKind::Local, json!({"path": "/out"})),
            source: Arc::new(LocalFileSource::new(root)),
            target: Arc::new(LocalFileTarget::new(root)),
            concurrency_key: "local".into(),
            max_workers: 2,
            check_is_modifying,
            page_size: 2,
        }
    }

    fn engine() -> TransferEngine {
        TransferEngine::new(
            Arc::new(ConcurrencyPools::new(Default::default(), 2)),
            TransferSettings {
                stream_threshold: 4,
                chunk_size: 3,
                ..TransferSettings::default()
            },
            CancellationToken::new(),
        )
    }

    fn ctx() -> TemplateContext {
        ContextBuilder::new(Utc::now()).build()
    }

    #[tokio::test]
    async fn discover_moves_matching_items_and_skips_rejected_ones() {
        let dir = tempfile::tempdir().unwrap();
        write_old(&dir.path().join("in/a.csv"), "alpha");
        write_old(&dir.path().join("in/b.csv"), "b");
        write_old(&dir.path().join("in/big.csv"), "0123456789");
        write_old(&dir.path().join("in/notes.txt"), "ignored");
        let plan = plan(
            dir.path(),
            json!({"path": "/in", "pattern": ".*\\.csv", "predicate": "source.item.file_size > 1"}),
            false,
        );

        let result = engine().execute(&plan, &ctx(), TransferMode::Discover).await.unwrap();

        assert_eq!(result.status(), RunStatus::Succeeded);
        assert_eq!(result.succeeded, vec!["/in/a.csv", "/in/big.csv"]);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].item, "/in/b.csv");
        assert_eq!(result.bytes, 15);
        assert_eq!(fs::read_to_string(dir.path().join("out/big.csv")).unwrap(), "0123456789");
        assert!(!dir.path().join("out/notes.txt").exists());
    }

    #[tokio::test]
    async fn each_listing_page_is_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.csv", "b.txt", "c.txt", "d.csv", "e.txt"] {
            write_old(&dir.path().join("in").join(name), "body");
        }
        write_old(&dir.path().join("in/f.csv"), "x");
        let mut plan = plan(
            dir.path(),
            json!({"path": "/in", "pattern": ".*\\.csv", "predicate": "source.item.file_size > 1"}),
            false,
        );
        plan.page_size = 1;

        let result = engine().execute(&plan, &ctx(), TransferMode::Discover).await.unwrap();

        assert_eq!(result.succeeded, vec!["/in/a.csv", "/in/d.csv"]);
        assert_eq!(result.skipped.len(), 1, "pattern misses leave no trace");
        assert_eq!(result.skipped[0].item, "/in/f.csv");
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn single_item_with_templated_file_name() {
        let dir = tempfile::tempdir().unwrap();
        write_old(&dir.path().join("in/a.csv"), "alpha");
        let plan = plan(
            dir.path(),
            json!({"path": "/in", "file_name": "{{ source.item.file_name }}"}),
            true,
        );
        let item: SourceItem = LocalFileSource::new(dir.path())
            .stat(&FileMeta::new("a.csv", "/in/a.csv", 0, 0).into())
            .unwrap();

        let result = engine().execute(&plan, &ctx(), TransferMode::Single(item)).await.unwrap();
        assert_eq!(result.succeeded, vec!["/in/a.csv"]);
        assert_eq!(fs::read_to_string(dir.path().join("out/a.csv")).unwrap(), "alpha");
    }

    #[tokio::test]
    async fn single_item_failure_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), json!({"path": "/in"}), false);
        let missing: SourceItem = FileMeta::new("gone.csv", "/in/gone.csv", 3, 0).into();

        let err = engine()
            .execute(&plan, &ctx(), TransferMode::Single(missing))
            .await
            .unwrap_err();
        match err {
            TransferError::Item(item_err) => assert_eq!(item_err.item, "/in/gone.csv"),
            other => panic!("expected item error, got {other}"),
        }
    }

    #[tokio::test]
    async fn files_still_being_written_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("in")).unwrap();
        fs::write(dir.path().join("in/hot.csv"), "partial").unwrap();
        let plan = plan(dir.path(), json!({"path": "/in"}), true);

        let result = engine().execute(&plan, &ctx(), TransferMode::Discover).await.unwrap();
        assert!(result.succeeded.is_empty());
        assert!(matches!(
            result.skipped[0].reason,
            SkipReason::RecentlyModified { .. }
        ));
        assert!(!dir.path().join("out/hot.csv").exists());
    }

    #[tokio::test]
    async fn cancelled_engine_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_old(&dir.path().join("in/a.csv"), "alpha");
        let engine = engine();
        engine.cancel_token().cancel();
        let err = engine
            .execute(
                &plan(dir.path(), json!({"path": "/in"}), false),
                &ctx(),
                TransferMode::Discover,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }

    #[tokio::test]
    async fn listing_failure_is_a_run_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = engine()
            .execute(
                &plan(dir.path(), json!({"path": "/missing"}), false),
                &ctx(),
                TransferMode::Discover,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Listing(_)));
    }
}
