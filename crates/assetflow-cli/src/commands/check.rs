use std::path::Path;

use anyhow::Result;

use super::Workspace;

/// Execute the `check` command: compile the pipeline and resolve every
/// connection its assets and sensors use.
pub fn execute(pipeline_path: &Path, environment: Option<&str>) -> Result<()> {
    let workspace = Workspace::open(pipeline_path, environment)?;
    let pipeline = &workspace.pipeline;

    println!("Pipeline '{}' ({}): OK", pipeline.name, pipeline.environment);
    println!("  Assets:    {}", pipeline.assets.len());
    println!("  Jobs:      {}", pipeline.jobs.len());
    println!("  Sensors:   {}", pipeline.sensors.len());
    println!("  Schedules: {}", pipeline.schedules.len());
    println!("  State:     {}", pipeline.state.resolve_path().display());

    println!("\nConnections:");
    for (name, spec) in &pipeline.connections {
        println!(
            "  {name} ({}): {}",
            spec.kind,
            serde_json::Value::Object(spec.masked())
        );
    }

    let mut failures = 0usize;
    let mut report = |label: String, result: Result<(), String>| match result {
        Ok(()) => println!("{label:32} OK"),
        Err(e) => {
            failures += 1;
            println!("{label:32} FAILED");
            println!("  {e}");
        }
    };

    println!();
    let registry = &workspace.registry;
    for asset in pipeline.assets.values() {
        let source = pipeline
            .connections
            .get(&asset.source.connection)
            .ok_or_else(|| format!("unknown connection '{}'", asset.source.connection))
            .and_then(|spec| registry.source(spec).map(|_| ()).map_err(|e| e.to_string()));
        report(format!("Asset '{}' source:", asset.name), source);

        let target = pipeline
            .connections
            .get(&asset.target.connection)
            .ok_or_else(|| format!("unknown connection '{}'", asset.target.connection))
            .and_then(|spec| registry.target(spec).map(|_| ()).map_err(|e| e.to_string()));
        report(format!("Asset '{}' target:", asset.name), target);
    }
    for sensor in pipeline.sensors.values() {
        let source = pipeline
            .connections
            .get(&sensor.source.connection)
            .ok_or_else(|| format!("unknown connection '{}'", sensor.source.connection))
            .and_then(|spec| {
                let resolved = if spec.kind.is_database() {
                    registry.rows(spec).map(|_| ())
                } else {
                    registry.source(spec).map(|_| ())
                };
                resolved.map_err(|e| e.to_string())
            });
        report(format!("Sensor '{}':", sensor.name), source);
    }

    if failures == 0 {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("{failures} check(s) failed")
    }
}
