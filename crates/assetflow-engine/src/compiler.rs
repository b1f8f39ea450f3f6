//! Pipeline compiler: layered config resolution, validation and the
//! immutable, name-indexed [`CompiledPipeline`] the runtime executes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use assetflow_types::cursor::CursorStrategy;
use assetflow_types::state::PartitionKey;
use cron::Schedule;
use serde_json::{Map, Value};

use crate::config::parser::{parse_pipeline, resolve_layers, substitute_in_value};
use crate::config::types::{
    parse_byte_size, ConnectionKind, ConnectionSpec, EndpointDef, PipelineDefinition, StateConfig,
};
use crate::config::validator::{validate_definition, GROUP_PREFIX, SELECT_ALL};
use crate::errors::DefinitionError;
use crate::partition::PartitionsDef;
use crate::template::helpers::parse_cron;
use crate::template::OperationKind;
use crate::transfer::TransferSettings;

/// A validated pipeline, ready to run.
#[derive(Debug, Clone)]
pub struct CompiledPipeline {
    pub name: String,
    /// Environment layer the connections and vars were resolved for.
    pub environment: String,
    pub assets: BTreeMap<String, CompiledAsset>,
    pub jobs: BTreeMap<String, CompiledJob>,
    pub sensors: BTreeMap<String, CompiledSensor>,
    pub schedules: BTreeMap<String, CompiledSchedule>,
    pub connections: BTreeMap<String, ConnectionSpec>,
    pub vars: Value,
    pub state: StateConfig,
    pub resources: ResourceSettings,
}

/// Resource limits with byte sizes parsed.
#[derive(Debug, Clone)]
pub struct ResourceSettings {
    pub pools: BTreeMap<String, usize>,
    pub default_pool_budget: usize,
    pub max_workers: usize,
    pub transfer: TransferSettings,
    pub page_size: usize,
    /// 0 retries transient sensor failures forever.
    pub max_retries: u32,
}

/// One side of an asset, or a sensor's watched location.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSpec {
    pub connection: String,
    pub kind: ConnectionKind,
    pub configs: Map<String, Value>,
}

impl EndpointSpec {
    #[must_use]
    pub fn operation_kind(&self) -> OperationKind {
        self.kind.operation_kind()
    }
}

#[derive(Debug, Clone)]
pub struct CompiledAsset {
    pub name: String,
    pub description: Option<String>,
    pub group: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// Pool this asset's transfers draw from.
    pub concurrency_key: String,
    pub max_workers: usize,
    pub partitions: Option<PartitionsDef>,
    pub check_is_modifying: bool,
    pub source: EndpointSpec,
    pub target: EndpointSpec,
}

#[derive(Debug, Clone)]
pub struct CompiledJob {
    pub name: String,
    pub description: Option<String>,
    /// Selected assets in definition order.
    pub assets: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CompiledSensor {
    pub name: String,
    pub job: String,
    pub source: EndpointSpec,
    pub min_interval: Duration,
    pub cursor: CursorStrategy,
    pub partition_key: Option<PartitionKey>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CompiledSchedule {
    pub name: String,
    pub job: String,
    pub cron: String,
    pub schedule: Schedule,
    pub tags: BTreeMap<String, String>,
}

impl CompiledPipeline {
    /// Whether `job` has a time-partitioned asset.
    #[must_use]
    pub fn job_partitions(&self, job: &str) -> Option<&PartitionsDef> {
        self.jobs
            .get(job)?
            .assets
            .iter()
            .filter_map(|name| self.assets.get(name))
            .find_map(|asset| asset.partitions.as_ref())
    }
}

/// Compile `def` for `environment`, reading `${VAR}` values from the
/// process environment.
///
/// # Errors
///
/// Returns a [`DefinitionError`] listing every problem found.
pub fn compile(
    def: &PipelineDefinition,
    environment: &str,
) -> Result<CompiledPipeline, DefinitionError> {
    compile_with(def, environment, &|name| std::env::var(name).ok())
}

/// Compile with an explicit `${VAR}` lookup.
///
/// # Errors
///
/// Returns a [`DefinitionError`] listing every problem found.
pub fn compile_with(
    def: &PipelineDefinition,
    environment: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<CompiledPipeline, DefinitionError> {
    let mut problems = Vec::new();
    let connections = resolve_connections(def, environment, lookup, &mut problems);
    problems.extend(validate_definition(def, &connections));
    DefinitionError::check(problems)?;

    let mut problems = Vec::new();
    let mut assets = BTreeMap::new();
    for asset in &def.assets {
        let partitions = asset.partitions.as_ref().map(PartitionsDef::from_config).transpose();
        let partitions = match partitions {
            Ok(p) => p,
            Err(e) => {
                problems.push(format!("Asset '{}': invalid partitions: {e}", asset.name));
                None
            }
        };
        let (Some(source), Some(target)) = (
            endpoint(&asset.source, &connections),
            endpoint(&asset.target, &connections),
        ) else {
            continue;
        };
        assets.insert(
            asset.name.clone(),
            CompiledAsset {
                name: asset.name.clone(),
                description: asset.description.clone(),
                group: asset.group.clone(),
                tags: asset.tags.clone(),
                concurrency_key: asset
                    .concurrency_key
                    .clone()
                    .unwrap_or_else(|| asset.source.connection.clone()),
                max_workers: asset.max_workers.unwrap_or(def.resources.max_workers),
                partitions,
                check_is_modifying: asset.check_is_modifying,
                source,
                target,
            },
        );
    }

    let jobs = def
        .jobs
        .iter()
        .map(|job| {
            let mut selected = BTreeSet::new();
            let assets: Vec<String> = def
                .assets
                .iter()
                .filter(|asset| {
                    job.selection.entries().iter().any(|entry| {
                        *entry == SELECT_ALL
                            || *entry == asset.name
                            || entry
                                .strip_prefix(GROUP_PREFIX)
                                .is_some_and(|g| asset.group.as_deref() == Some(g))
                    })
                })
                .filter(|asset| selected.insert(asset.name.clone()))
                .map(|asset| asset.name.clone())
                .collect();
            let compiled = CompiledJob {
                name: job.name.clone(),
                description: job.description.clone(),
                assets,
                tags: job.tags.clone(),
            };
            (job.name.clone(), compiled)
        })
        .collect();

    let mut sensors = BTreeMap::new();
    for sensor in &def.sensors {
        let Some(spec) = connections.get(&sensor.connection) else {
            continue;
        };
        sensors.insert(
            sensor.name.clone(),
            CompiledSensor {
                name: sensor.name.clone(),
                job: sensor.job.clone(),
                source: EndpointSpec {
                    connection: sensor.connection.clone(),
                    kind: spec.kind,
                    configs: sensor.configs.clone(),
                },
                min_interval: Duration::from_secs(sensor.minimum_interval_seconds),
                // Database sensors only track the cursor column.
                cursor: if spec.kind.is_database() {
                    CursorStrategy::MaxKey
                } else {
                    sensor.cursor
                },
                partition_key: sensor.partition_key.as_deref().map(PartitionKey::new),
                tags: sensor.tags.clone(),
            },
        );
    }

    let mut schedules = BTreeMap::new();
    for schedule in &def.schedules {
        match parse_cron(&schedule.cron) {
            Ok(parsed) => {
                schedules.insert(
                    schedule.name.clone(),
                    CompiledSchedule {
                        name: schedule.name.clone(),
                        job: schedule.job.clone(),
                        cron: schedule.cron.clone(),
                        schedule: parsed,
                        tags: schedule.tags.clone(),
                    },
                );
            }
            Err(e) => problems.push(format!("Schedule '{}': {e}", schedule.name)),
        }
    }

    let resources = resource_settings(def, &mut problems);
    DefinitionError::check(problems)?;

    tracing::debug!(
        pipeline = %def.pipeline,
        environment,
        assets = assets.len(),
        sensors = sensors.len(),
        "Pipeline compiled"
    );

    Ok(CompiledPipeline {
        name: def.pipeline.clone(),
        environment: environment.to_string(),
        assets,
        jobs,
        sensors,
        schedules,
        connections,
        vars: resolve_layers(&def.vars, environment),
        state: def.state.clone(),
        resources,
    })
}

/// Parse and compile a pipeline file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the
/// definition is invalid.
pub fn load_pipeline(path: &Path, environment: &str) -> anyhow::Result<CompiledPipeline> {
    let def = parse_pipeline(path)?;
    let compiled = compile(&def, environment)
        .with_context(|| format!("Failed to compile pipeline {}", path.display()))?;
    Ok(compiled)
}

fn resolve_connections(
    def: &PipelineDefinition,
    environment: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    problems: &mut Vec<String>,
) -> BTreeMap<String, ConnectionSpec> {
    let mut missing = Vec::new();
    let mut connections = BTreeMap::new();

    let Value::Object(layered) = resolve_layers(&def.connections, environment) else {
        return connections;
    };
    for (name, mut raw) in layered {
        substitute_in_value(&mut raw, lookup, &mut missing);
        match serde_json::from_value::<ConnectionSpec>(raw) {
            Ok(spec) => {
                connections.insert(name, spec);
            }
            Err(e) => problems.push(format!("Connection '{name}' is invalid: {e}")),
        }
    }
    if !missing.is_empty() {
        problems.push(format!(
            "Missing environment variable(s): {}",
            missing.join(", ")
        ));
    }
    connections
}

fn endpoint(
    def: &EndpointDef,
    connections: &BTreeMap<String, ConnectionSpec>,
) -> Option<EndpointSpec> {
    connections.get(&def.connection).map(|spec| EndpointSpec {
        connection: def.connection.clone(),
        kind: spec.kind,
        configs: def.configs.clone(),
    })
}

fn resource_settings(def: &PipelineDefinition, problems: &mut Vec<String>) -> ResourceSettings {
    let res = &def.resources;
    let mut size = |name: &str, raw: &str| match parse_byte_size(raw) {
        Ok(n) => n,
        Err(e) => {
            problems.push(format!("Invalid {name}: {e}"));
            0
        }
    };
    let stream_threshold = size("stream_threshold", &res.stream_threshold);
    let chunk_size = usize::try_from(size("chunk_size", &res.chunk_size)).unwrap_or(usize::MAX);

    ResourceSettings {
        pools: res.pools.clone(),
        default_pool_budget: res.default_pool_budget,
        max_workers: res.max_workers,
        transfer: TransferSettings {
            stream_threshold,
            chunk_size,
            progress_step_percent: res.progress_step_percent,
            modifying_grace: Duration::from_secs(res.modifying_grace_seconds),
        },
        page_size: res.page_size,
        max_retries: res.max_retries,
    }
}
