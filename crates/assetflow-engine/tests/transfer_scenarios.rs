//! Discovery-and-stream runs of the landing fixture against instrumented
//! connections: shared pool budgets, per-item failure isolation and
//! cancellation part way through a run.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use assetflow_engine::compiler::{compile_with, CompiledPipeline};
use assetflow_engine::config::parser::parse_pipeline_str;
use assetflow_engine::config::types::ConnectionKind;
use assetflow_engine::connector::{
    ConnectorRegistry, ListPage, ListRequest, LocalFileSource, SourceConnector, ROOT_DIR_KEY,
};
use assetflow_engine::transfer::{ConcurrencyPools, TransferEngine, TransferSettings};
use assetflow_engine::{MaterializeRequest, Materializer};
use assetflow_state::{CursorStore, SqliteCursorStore};
use assetflow_types::error::ConnectorError;
use assetflow_types::item::{ItemKind, SourceItem};
use assetflow_types::state::RunStatus;
use tokio_util::sync::CancellationToken;

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests/fixtures/pipelines/landing_to_lake.yaml")
}

fn compiled(root: &Path) -> CompiledPipeline {
    let yaml = std::fs::read_to_string(fixture_path()).expect("Failed to read fixture");
    let root = root.display().to_string();
    let lookup = move |name: &str| match name {
        "AF_ROOT" => Some(root.clone()),
        "AF_SFTP_PASSWORD" => Some("secret".to_string()),
        _ => None,
    };
    compile_with(&parse_pipeline_str(&yaml).unwrap(), "dev", &lookup).unwrap()
}

fn seed(root: &Path, name: &str, body: &str) {
    let inbox = root.join("sftp/outbound");
    std::fs::create_dir_all(&inbox).unwrap();
    let path = inbox.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(600))
        .unwrap();
}

fn landed(root: &Path) -> Vec<String> {
    let dir = root.join("lake/raw/orders");
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

// ---------------------------------------------------------------------------
// Instrumented SFTP stand-in
// ---------------------------------------------------------------------------

/// Open connections right now, and the most ever open at once.
#[derive(Debug, Default)]
struct Gauge {
    opened: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InstrumentedSource {
    inner: LocalFileSource,
    gauge: Arc<Gauge>,
    hold: Duration,
    broken: Option<String>,
}

impl SourceConnector for InstrumentedSource {
    fn item_kind(&self) -> ItemKind {
        self.inner.item_kind()
    }

    fn list_page(
        &self,
        request: &ListRequest,
        continuation: Option<&str>,
    ) -> Result<ListPage, ConnectorError> {
        self.inner.list_page(request, continuation)
    }

    fn stat(&self, item: &SourceItem) -> Result<SourceItem, ConnectorError> {
        self.inner.stat(item)
    }

    fn open(&self, item: &SourceItem) -> Result<Box<dyn Read + Send>, ConnectorError> {
        let reader = self.inner.open(item)?;
        self.gauge.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.gauge.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(TrackedReader {
            inner: reader,
            gauge: Arc::clone(&self.gauge),
            hold: Some(self.hold),
            broken: self.broken.as_deref() == Some(item.display_name()),
            served: 0,
        }))
    }
}

/// Holds its connection for `hold` on first read; a broken reader fails
/// once it has served some bytes.
struct TrackedReader {
    inner: Box<dyn Read + Send>,
    gauge: Arc<Gauge>,
    hold: Option<Duration>,
    broken: bool,
    served: usize,
}

impl Read for TrackedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(hold) = self.hold.take() {
            std::thread::sleep(hold);
        }
        if self.broken && self.served > 0 {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"));
        }
        let n = self.inner.read(buf)?;
        self.served += n;
        Ok(n)
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Harness {
    materializer: Materializer,
    store: Arc<SqliteCursorStore>,
    gauge: Arc<Gauge>,
    pools: Arc<ConcurrencyPools>,
    cancel: CancellationToken,
}

fn harness(root: &Path, hold: Duration, broken: Option<&str>) -> Harness {
    harness_with(root, hold, broken, |_| {})
}

fn harness_with(
    root: &Path,
    hold: Duration,
    broken: Option<&str>,
    tune: impl FnOnce(&mut TransferSettings),
) -> Harness {
    let pipeline = compiled(root);
    let gauge = Arc::new(Gauge::default());

    let mut registry = ConnectorRegistry::with_builtins();
    let factory_gauge = Arc::clone(&gauge);
    let broken = broken.map(str::to_string);
    registry.register_source(ConnectionKind::Sftp, move |spec| {
        let root = spec
            .get_str(ROOT_DIR_KEY)
            .ok_or_else(|| ConnectorError::config("NO_ROOT", "root_dir missing"))?;
        Ok(Arc::new(InstrumentedSource {
            inner: LocalFileSource::new(root),
            gauge: Arc::clone(&factory_gauge),
            hold,
            broken: broken.clone(),
        }) as Arc<dyn SourceConnector>)
    });

    let pools = Arc::new(ConcurrencyPools::from_settings(&pipeline.resources));
    let mut settings = pipeline.resources.transfer.clone();
    tune(&mut settings);
    let cancel = CancellationToken::new();
    let engine = TransferEngine::new(Arc::clone(&pools), settings, cancel.clone());
    let store = Arc::new(SqliteCursorStore::in_memory().unwrap());
    let materializer = Materializer::new(
        Arc::new(pipeline),
        Arc::new(registry),
        store.clone(),
        Arc::new(engine),
    )
    .with_env(BTreeMap::new());

    Harness {
        materializer,
        store,
        gauge,
        pools,
        cancel,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_budget_caps_open_connections() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..5 {
        seed(dir.path(), &format!("part_{i}.csv"), "id,total\n1,10\n");
    }
    let h = harness(dir.path(), Duration::from_millis(60), None);
    assert_eq!(h.materializer.pipeline().assets["orders"].concurrency_key, "sftp_in");

    let result = h
        .materializer
        .materialize(&MaterializeRequest::asset("orders"))
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Succeeded);
    assert_eq!(result.succeeded.len(), 5);
    assert_eq!(h.gauge.opened.load(Ordering::SeqCst), 5);
    let peak = h.gauge.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrent connections was {peak}");
    assert_eq!(h.gauge.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(landed(dir.path()).len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_failing_item_does_not_stop_its_siblings() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..10 {
        seed(dir.path(), &format!("item_{i:02}.csv"), "id,total\n1,10\n2,20\n");
    }
    let h = harness(dir.path(), Duration::ZERO, Some("item_07.csv"));

    let result = h
        .materializer
        .materialize(&MaterializeRequest::asset("orders"))
        .await
        .unwrap();

    assert_eq!(result.status(), RunStatus::Partial);
    assert_eq!(result.succeeded.len(), 9);
    assert_eq!(result.failed_items(), vec!["/outbound/item_07.csv"]);
    assert!(result.failed[0].to_string().contains("connection reset"));

    let landed = landed(dir.path());
    assert_eq!(landed.len(), 9);
    assert!(!landed.contains(&"item_07.csv".to_string()));

    let history = h.store.recent_runs("orders", 1).unwrap();
    assert_eq!(history[0].status, RunStatus::Partial);
    assert_eq!(history[0].stats.items_succeeded, 9);
    assert_eq!(history[0].stats.items_failed, 1);
}

#[tokio::test]
async fn rerun_overwrites_in_place() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), "orders_1.csv", "v1");
    let h = harness(dir.path(), Duration::ZERO, None);
    h.materializer
        .materialize(&MaterializeRequest::asset("orders"))
        .await
        .unwrap();

    seed(dir.path(), "orders_1.csv", "v2");
    let result = h
        .materializer
        .materialize(&MaterializeRequest::asset("orders"))
        .await
        .unwrap();

    assert_eq!(result.succeeded.len(), 1);
    assert_eq!(landed(dir.path()), vec!["orders_1.csv"]);
    let body = std::fs::read_to_string(dir.path().join("lake/raw/orders/orders_1.csv")).unwrap();
    assert_eq!(body, "v2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_mid_run_releases_slots_and_leaves_no_partial_files() {
    let dir = tempfile::tempdir().unwrap();
    let body = "x".repeat(64);
    for i in 0..6 {
        seed(dir.path(), &format!("chunk_{i}.csv"), &body);
    }
    let h = harness_with(dir.path(), Duration::from_millis(300), None, |settings| {
        settings.stream_threshold = 8;
        settings.chunk_size = 8;
    });
    assert_eq!(h.pools.available("sftp_in"), 2);

    let gauge = Arc::clone(&h.gauge);
    let cancel = h.cancel.clone();
    let trigger = tokio::spawn(async move {
        while gauge.opened.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
    });

    let result = h
        .materializer
        .materialize(&MaterializeRequest::asset("orders"))
        .await
        .unwrap();
    trigger.await.unwrap();

    assert_eq!(result.status(), RunStatus::Cancelled);
    assert!(result.succeeded.is_empty(), "{:?}", result.succeeded);
    assert!(h.gauge.opened.load(Ordering::SeqCst) < 6, "no new items after cancel");
    assert_eq!(h.gauge.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(h.pools.available("sftp_in"), 2, "every pool slot released");
    assert!(landed(dir.path()).is_empty(), "aborted writers left {:?}", landed(dir.path()));

    let history = h.store.recent_runs("orders", 1).unwrap();
    assert_eq!(history[0].status, RunStatus::Cancelled);
}
