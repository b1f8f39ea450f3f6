use std::path::Path;

use anyhow::Result;
use assetflow_types::state::{PartitionKey, SensorName};

use super::Workspace;

/// Execute the `cursor` command: print a sensor's persisted cursor, or
/// delete it with `reset`.
pub fn execute(
    pipeline_path: &Path,
    environment: Option<&str>,
    sensor: &str,
    partition: Option<&str>,
    reset: bool,
) -> Result<()> {
    let workspace = Workspace::open(pipeline_path, environment)?;
    if !workspace.pipeline.sensors.contains_key(sensor) {
        anyhow::bail!("Unknown sensor '{sensor}'");
    }
    let name = SensorName::new(sensor);
    let partition = partition.map(PartitionKey::new);

    if reset {
        if workspace.store.clear(&name, partition.as_ref())? {
            println!("Cursor of sensor '{sensor}' reset.");
        } else {
            println!("Sensor '{sensor}' has no cursor.");
        }
        return Ok(());
    }

    match workspace.store.read(&name, partition.as_ref())? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("Sensor '{sensor}' has no cursor."),
    }
    Ok(())
}
