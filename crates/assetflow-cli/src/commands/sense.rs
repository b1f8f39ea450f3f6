use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use assetflow_engine::context::ContextBuilder;
use assetflow_engine::discovery::{
    run_sensors, ChannelSink, RunRequestSink, ScheduleEvaluator, SensorCore, SensorRunner,
};
use assetflow_engine::Dispatcher;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::{cancel_on_ctrl_c, Workspace};

const REQUEST_QUEUE: usize = 64;
const SCHEDULE_TICK: Duration = Duration::from_secs(30);

/// Execute the `sense` command: poll sensors and schedules and run the
/// jobs they request until interrupted.
pub async fn execute(
    pipeline_path: &Path,
    environment: Option<&str>,
    only_sensor: Option<&str>,
    once: bool,
) -> Result<()> {
    let workspace = Workspace::open(pipeline_path, environment)?;
    let pipeline = Arc::clone(&workspace.pipeline);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    if let Some(name) = only_sensor {
        if !pipeline.sensors.contains_key(name) {
            anyhow::bail!("Unknown sensor '{name}'");
        }
    }

    let mut runners = Vec::new();
    for sensor in pipeline.sensors.values() {
        if only_sensor.is_some_and(|name| name != sensor.name) {
            continue;
        }
        let spec = pipeline
            .connections
            .get(&sensor.source.connection)
            .with_context(|| format!("Sensor '{}': unknown connection", sensor.name))?;
        let context = ContextBuilder::new(Utc::now())
            .process_env()
            .vars(pipeline.vars.clone());
        let store = Arc::clone(&workspace.store);
        let core = if spec.kind.is_database() {
            let rows = workspace
                .registry
                .rows(spec)
                .with_context(|| format!("Sensor '{}': no row source backend", sensor.name))?;
            SensorCore::for_rows(sensor, context, rows, store)
        } else {
            let source = workspace
                .registry
                .source(spec)
                .with_context(|| format!("Sensor '{}': no source backend", sensor.name))?;
            SensorCore::new(sensor, context, pipeline.resources.page_size, source, store)
        };
        runners.push(SensorRunner::new(
            core,
            sensor.min_interval,
            pipeline.resources.max_retries,
            cancel.clone(),
        ));
    }
    let schedules: Vec<ScheduleEvaluator> = if only_sensor.is_some() {
        Vec::new()
    } else {
        pipeline
            .schedules
            .values()
            .map(|s| ScheduleEvaluator::new(&pipeline, s, Arc::clone(&workspace.store)))
            .collect()
    };

    tracing::info!(
        pipeline = pipeline.name,
        sensors = runners.len(),
        schedules = schedules.len(),
        once,
        "Starting discovery"
    );

    // The dispatcher drains the queue even after Ctrl-C; in-flight transfers
    // observe the cancellation through the engine.
    let (sink, rx) = ChannelSink::channel(REQUEST_QUEUE);
    let dispatcher = Dispatcher::new(Arc::new(workspace.materializer(cancel.clone())));
    let dispatch_task =
        tokio::spawn(async move { dispatcher.run(rx, CancellationToken::new()).await });

    let sink: Arc<dyn RunRequestSink> = Arc::new(sink);
    let mut sensor_failures = 0usize;
    if once {
        for mut runner in runners {
            match runner.run_once(sink.as_ref()).await {
                Ok(outcome) => println!(
                    "Sensor '{}': listed {}, matched {}, emitted {}",
                    runner.name(),
                    outcome.listed,
                    outcome.matched,
                    outcome.emitted
                ),
                Err(e) => {
                    sensor_failures += 1;
                    println!("Sensor '{}': FAILED: {e}", runner.name());
                }
            }
        }
        for schedule in &schedules {
            if let Err(e) = schedule.evaluate(Utc::now(), sink.as_ref()).await {
                sensor_failures += 1;
                println!("Schedule: FAILED: {e}");
            }
        }
    } else {
        let schedule_task = {
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            tokio::spawn(async move { run_schedules(schedules, sink, cancel).await })
        };
        let sensor_count = runners.len();
        for (name, result) in run_sensors(runners, Arc::clone(&sink)).await {
            if let Err(e) = result {
                sensor_failures += 1;
                println!("Sensor '{name}': stopped: {e}");
            }
        }
        if sensor_count == 0 {
            cancel.cancelled().await;
        }
        cancel.cancel();
        if let Err(e) = schedule_task.await {
            tracing::error!(error = %e, "Schedule task panicked");
        }
    }

    drop(sink);
    let stats = dispatch_task.await.context("Dispatcher task panicked")?;
    println!(
        "Runs: {} completed, {} duplicate, {} failed",
        stats.completed, stats.duplicates, stats.failed
    );

    if sensor_failures > 0 || stats.failed > 0 {
        anyhow::bail!("{sensor_failures} discovery failure(s), {} failed run(s)", stats.failed)
    }
    Ok(())
}

async fn run_schedules(
    schedules: Vec<ScheduleEvaluator>,
    sink: Arc<dyn RunRequestSink>,
    cancel: CancellationToken,
) {
    if schedules.is_empty() {
        return;
    }
    let mut ticker = tokio::time::interval(SCHEDULE_TICK);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for schedule in &schedules {
            if let Err(e) = schedule.evaluate(Utc::now(), sink.as_ref()).await {
                tracing::warn!(error = %e, "Schedule evaluation failed");
            }
        }
    }
}
