//! Sensor cycles over the landing fixture: emission order, idempotent
//! polling and at-least-once recovery when hand-off fails mid-cycle.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assetflow_engine::compiler::{compile_with, CompiledPipeline};
use assetflow_engine::config::parser::parse_pipeline_str;
use assetflow_engine::connector::LocalFileSource;
use assetflow_engine::context::ContextBuilder;
use assetflow_engine::discovery::{MemorySink, RunRequestSink, SensorCore, SensorState, SinkError};
use assetflow_engine::DiscoveryError;
use assetflow_state::{CursorStore, SqliteCursorStore};
use assetflow_types::cursor::CursorValue;
use assetflow_types::run::{RunRequest, TAG_SOURCE_ITEM};
use assetflow_types::state::{CursorRecord, SensorName};
use async_trait::async_trait;
use chrono::Utc;

const SENSOR: &str = "orders_landing";

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

fn touch(root: &Path, name: &str, mtime: u64) {
    let inbox = root.join("sftp/outbound");
    std::fs::create_dir_all(&inbox).unwrap();
    let path = inbox.join(name);
    std::fs::write(&path, name.as_bytes()).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(std::time::UNIX_EPOCH + Duration::from_secs(mtime))
        .unwrap();
}

fn sensor_core(root: &Path, store: Arc<dyn CursorStore>) -> SensorCore {
    let pipeline = compiled(root);
    SensorCore::new(
        &pipeline.sensors[SENSOR],
        ContextBuilder::new(Utc::now()).vars(pipeline.vars.clone()),
        pipeline.resources.page_size,
        Arc::new(LocalFileSource::new(root.join("sftp"))),
        store,
    )
}

fn emitted(requests: &[RunRequest]) -> Vec<String> {
    requests.iter().map(|r| r.tags[TAG_SOURCE_ITEM].clone()).collect()
}

/// Accepts `capacity` requests, then refuses everything, like a process
/// that dies while handing requests off.
struct DyingSink {
    accepted: Mutex<Vec<RunRequest>>,
    capacity: usize,
}

#[async_trait]
impl RunRequestSink for DyingSink {
    async fn submit(&self, request: RunRequest) -> Result<(), SinkError> {
        let mut accepted = self.accepted.lock().unwrap();
        if accepted.len() >= self.capacity {
            return Err(SinkError("process terminated".into()));
        }
        accepted.push(request);
        Ok(())
    }
}

#[tokio::test]
async fn cursor_filters_and_ties_break_by_name() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "b.csv", 100);
    touch(dir.path(), "c.csv", 90);
    touch(dir.path(), "a.csv", 100);

    let store = Arc::new(SqliteCursorStore::in_memory().unwrap());
    store
        .write(
            &SensorName::new(SENSOR),
            None,
            &CursorRecord {
                value: CursorValue::HighWaterMark { value: 90 },
                updated_at: "2024-01-01T00:00:00Z".into(),
            },
        )
        .unwrap();

    let mut core = sensor_core(dir.path(), store);
    let sink = MemorySink::new();
    let outcome = core.run_cycle(&sink, Utc::now()).await.unwrap();

    assert_eq!(outcome.listed, 3);
    assert_eq!(emitted(&sink.take()), vec!["/outbound/a.csv", "/outbound/b.csv"]);
    assert_eq!(outcome.cursor, Some(CursorValue::HighWaterMark { value: 100 }));
}

#[tokio::test]
async fn emission_follows_modification_time() {
    let dir = tempfile::tempdir().unwrap();
    // More items than one listing page.
    let files = [
        ("z.csv", 30),
        ("m.csv", 10),
        ("a.csv", 20),
        ("k.csv", 50),
        ("q.csv", 40),
        ("x.txt", 5),
    ];
    for (name, mtime) in files {
        touch(dir.path(), name, mtime);
    }

    let store = Arc::new(SqliteCursorStore::in_memory().unwrap());
    let mut core = sensor_core(dir.path(), store);
    let sink = MemorySink::new();
    let outcome = core.run_cycle(&sink, Utc::now()).await.unwrap();

    assert_eq!(outcome.listed, 6);
    assert_eq!(outcome.matched, 5);
    assert_eq!(
        emitted(&sink.take()),
        vec![
            "/outbound/m.csv",
            "/outbound/a.csv",
            "/outbound/z.csv",
            "/outbound/q.csv",
            "/outbound/k.csv"
        ]
    );
}

#[tokio::test]
async fn unchanged_source_emits_nothing_on_the_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "a.csv", 100);
    touch(dir.path(), "b.csv", 200);

    let store: Arc<dyn CursorStore> = Arc::new(SqliteCursorStore::in_memory().unwrap());
    let mut core = sensor_core(dir.path(), Arc::clone(&store));
    let sink = MemorySink::new();
    assert_eq!(core.run_cycle(&sink, Utc::now()).await.unwrap().emitted, 2);
    assert_eq!(core.run_cycle(&sink, Utc::now()).await.unwrap().emitted, 0);

    // A restarted sensor reads the same durable cursor.
    let mut restarted = sensor_core(dir.path(), store);
    assert_eq!(restarted.run_cycle(&sink, Utc::now()).await.unwrap().emitted, 0);
    assert_eq!(sink.requests().len(), 2);
}

#[tokio::test]
async fn failed_hand_off_reemits_on_the_next_poll() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "a.csv", 100);
    touch(dir.path(), "b.csv", 200);

    let store: Arc<dyn CursorStore> = Arc::new(SqliteCursorStore::in_memory().unwrap());
    let mut core = sensor_core(dir.path(), Arc::clone(&store));

    let dying = DyingSink {
        accepted: Mutex::new(Vec::new()),
        capacity: 1,
    };
    let err = core.run_cycle(&dying, Utc::now()).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Sink(_)));
    assert_eq!(core.state(), SensorState::Failed);
    assert!(store.read(&SensorName::new(SENSOR), None).unwrap().is_none());

    let mut restarted = sensor_core(dir.path(), Arc::clone(&store));
    let sink = MemorySink::new();
    let outcome = restarted.run_cycle(&sink, Utc::now()).await.unwrap();
    assert_eq!(outcome.emitted, 2);

    let replayed = sink.take();
    assert_eq!(emitted(&replayed), vec!["/outbound/a.csv", "/outbound/b.csv"]);
    // Same run key, so the consumer can drop the duplicate.
    let first = dying.accepted.lock().unwrap()[0].run_key.clone();
    assert_eq!(replayed[0].run_key, first);
}
