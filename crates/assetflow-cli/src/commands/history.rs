use std::path::Path;

use anyhow::Result;
use assetflow_engine::result::format_size;

use super::Workspace;

/// Execute the `history` command: list the latest runs of an asset.
pub fn execute(
    pipeline_path: &Path,
    environment: Option<&str>,
    asset: &str,
    limit: usize,
) -> Result<()> {
    let workspace = Workspace::open(pipeline_path, environment)?;
    if !workspace.pipeline.assets.contains_key(asset) {
        anyhow::bail!("Unknown asset '{asset}'");
    }

    let runs = workspace.store.recent_runs(asset, limit)?;
    if runs.is_empty() {
        println!("Asset '{asset}' has no runs.");
        return Ok(());
    }

    println!(
        "{:>6}  {:10} {:22} {:>6} {:>6} {:>6} {:>10}",
        "ID", "STATUS", "STARTED", "OK", "FAIL", "SKIP", "BYTES"
    );
    for run in &runs {
        println!(
            "{:>6}  {:10} {:22} {:>6} {:>6} {:>6} {:>10}",
            run.id,
            run.status.as_str(),
            run.started_at,
            run.stats.items_succeeded,
            run.stats.items_failed,
            run.stats.items_skipped,
            format_size(run.stats.bytes_moved)
        );
        if let Some(message) = &run.stats.error_message {
            println!("        {message}");
        }
    }
    Ok(())
}
