use std::path::Path;

use anyhow::Result;
use assetflow_engine::result::format_size;
use assetflow_engine::{MaterializeRequest, TransferResult};
use assetflow_types::state::{PartitionKey, RunStatus};
use tokio_util::sync::CancellationToken;

use super::{cancel_on_ctrl_c, Workspace};

/// Execute the `run` command: materialize one asset, optionally for one
/// partition.
pub async fn execute(
    pipeline_path: &Path,
    environment: Option<&str>,
    asset: &str,
    partition: Option<&str>,
) -> Result<()> {
    let workspace = Workspace::open(pipeline_path, environment)?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let materializer = workspace.materializer(cancel);
    let request = MaterializeRequest::asset(asset).with_partition(partition.map(PartitionKey::new));
    let result = materializer.materialize(&request).await?;

    print_result(&result);
    match result.status() {
        RunStatus::Succeeded => Ok(()),
        status => anyhow::bail!("Asset '{}' finished {status}", result.asset),
    }
}

fn print_result(result: &TransferResult) {
    println!("Asset '{}' {}.", result.asset, result.status());
    println!("  Items moved:   {}", result.succeeded.len());
    println!("  Items failed:  {}", result.failed.len());
    println!("  Items skipped: {}", result.skipped.len());
    println!("  Bytes moved:   {}", format_size(result.bytes));
    println!("  Duration:      {:.2}s", result.duration.as_secs_f64());
    println!("  Throughput:    {}/s", format_size(result.throughput() as u64));
    for failure in &result.failed {
        println!("  FAILED  {failure}");
    }
    for skipped in &result.skipped {
        println!("  SKIPPED {}: {}", skipped.item, skipped.reason);
    }
}
