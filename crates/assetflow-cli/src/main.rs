mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "assetflow",
    version,
    about = "Declarative file and object pipelines driven by sensors and schedules"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Environment layer for connections and vars (default: dev)
    #[arg(long = "env", env = "ASSETFLOW_ENV", global = true)]
    environment: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a pipeline and check that every connection has a backend
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Materialize one asset
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Asset name
        #[arg(long)]
        asset: String,
        /// Partition key (e.g. "2024-03-01")
        #[arg(long)]
        partition: Option<String>,
    },
    /// Poll sensors and schedules, running the jobs they trigger
    Sense {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Only this sensor (schedules are skipped)
        #[arg(long)]
        sensor: Option<String>,
        /// Evaluate every sensor and schedule once, then exit
        #[arg(long)]
        once: bool,
    },
    /// Show or reset a sensor cursor
    Cursor {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Sensor name
        #[arg(long)]
        sensor: String,
        /// Partition key of a partitioned sensor
        #[arg(long)]
        partition: Option<String>,
        /// Delete the cursor so the next cycle starts from scratch
        #[arg(long)]
        reset: bool,
    },
    /// Show recent runs of an asset
    History {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Asset name
        #[arg(long)]
        asset: String,
        /// Number of runs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);
    let env = cli.environment.as_deref();

    match cli.command {
        Commands::Check { pipeline } => commands::check::execute(&pipeline, env),
        Commands::Run {
            pipeline,
            asset,
            partition,
        } => commands::run::execute(&pipeline, env, &asset, partition.as_deref()).await,
        Commands::Sense {
            pipeline,
            sensor,
            once,
        } => commands::sense::execute(&pipeline, env, sensor.as_deref(), once).await,
        Commands::Cursor {
            pipeline,
            sensor,
            partition,
            reset,
        } => commands::cursor::execute(&pipeline, env, &sensor, partition.as_deref(), reset),
        Commands::History {
            pipeline,
            asset,
            limit,
        } => commands::history::execute(&pipeline, env, &asset, limit),
    }
}
