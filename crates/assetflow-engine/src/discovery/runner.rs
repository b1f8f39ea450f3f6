//! Sensor loops: serial cycles per sensor, distinct sensors concurrently.

use std::sync::Arc;
use std::time::Duration;

use assetflow_types::state::SensorName;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::sensor::{CycleOutcome, SensorCore};
use super::sink::RunRequestSink;
use crate::errors::DiscoveryError;

/// Drives one [`SensorCore`] until cancelled or permanently failed.
#[derive(Debug)]
pub struct SensorRunner {
    core: SensorCore,
    min_interval: Duration,
    /// Consecutive transient failures tolerated; 0 means unlimited.
    max_retries: u32,
    cancel: CancellationToken,
}

impl SensorRunner {
    #[must_use]
    pub fn new(
        core: SensorCore,
        min_interval: Duration,
        max_retries: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            core,
            min_interval,
            max_retries,
            cancel,
        }
    }

    #[must_use]
    pub fn name(&self) -> &SensorName {
        self.core.name()
    }

    /// Run exactly one cycle.
    ///
    /// # Errors
    ///
    /// Returns the cycle's [`DiscoveryError`].
    pub async fn run_once(
        &mut self,
        sink: &dyn RunRequestSink,
    ) -> Result<CycleOutcome, DiscoveryError> {
        self.core.run_cycle(sink, Utc::now()).await
    }

    /// Poll every `min_interval` until cancelled.
    ///
    /// A failed cycle backs off exponentially and retries. Only a permanent
    /// failure (see [`DiscoveryError::is_permanent`]), or more than
    /// `max_retries` failures in a row, ends the loop with that error.
    ///
    /// # Errors
    ///
    /// Returns the [`DiscoveryError`] that stopped the sensor.
    pub async fn run(mut self, sink: Arc<dyn RunRequestSink>) -> Result<(), DiscoveryError> {
        let mut failures: u32 = 0;
        tracing::info!(
            sensor = %self.core.name(),
            interval_secs = self.min_interval.as_secs(),
            "Sensor started"
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let delay = match self.core.run_cycle(sink.as_ref(), Utc::now()).await {
                Ok(_) => {
                    failures = 0;
                    self.min_interval
                }
                Err(err) if err.is_permanent() => {
                    tracing::error!(
                        sensor = %self.core.name(),
                        error = %err,
                        "Sensor failed permanently"
                    );
                    return Err(err);
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    if self.max_retries > 0 && failures > self.max_retries {
                        tracing::error!(
                            sensor = %self.core.name(),
                            attempts = failures,
                            error = %err,
                            "Sensor retries exhausted"
                        );
                        return Err(err);
                    }
                    let backoff = err.retry_delay(self.min_interval, failures);
                    tracing::warn!(
                        sensor = %self.core.name(),
                        attempt = failures,
                        delay_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Discovery cycle failed, retrying"
                    );
                    backoff
                }
            };

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(sensor = %self.core.name(), "Sensor stopped");
        Ok(())
    }
}

/// Run every sensor concurrently until all stop. Returns each sensor's
/// final result.
pub async fn run_sensors(
    runners: Vec<SensorRunner>,
    sink: Arc<dyn RunRequestSink>,
) -> Vec<(SensorName, Result<(), DiscoveryError>)> {
    let mut join_set = JoinSet::new();
    for runner in runners {
        let sink = Arc::clone(&sink);
        let name = runner.name().clone();
        join_set.spawn(async move { (name, runner.run(sink).await) });
    }

    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => tracing::error!(error = %e, "Sensor task panicked"),
        }
    }
    results
}
