//! Error taxonomy for compilation, discovery and transfer, plus the retry
//! backoff policy.

use std::time::Duration;

use assetflow_state::StateError;
use assetflow_types::error::{BackoffClass, ConnectorError, ErrorCategory};

use crate::template::TemplateError;

const BACKOFF_FAST_BASE_MS: u64 = 100;
const BACKOFF_NORMAL_BASE_MS: u64 = 1_000;
const BACKOFF_SLOW_BASE_MS: u64 = 5_000;
const BACKOFF_MAX_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// DefinitionError (compile time)
// ---------------------------------------------------------------------------

/// A pipeline definition that cannot be deployed. Every problem found is
/// listed; nothing from the definition is applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Pipeline definition is invalid:\n  - {}", problems.join("\n  - "))]
pub struct DefinitionError {
    pub problems: Vec<String>,
}

impl DefinitionError {
    #[must_use]
    pub fn new(problems: Vec<String>) -> Self {
        Self { problems }
    }

    #[must_use]
    pub fn single(problem: impl Into<String>) -> Self {
        Self {
            problems: vec![problem.into()],
        }
    }

    /// `Ok(())` when `problems` is empty.
    ///
    /// # Errors
    ///
    /// Returns the collected problems otherwise.
    pub fn check(problems: Vec<String>) -> Result<(), Self> {
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Self { problems })
        }
    }
}

// ---------------------------------------------------------------------------
// DiscoveryError (one poll cycle)
// ---------------------------------------------------------------------------

/// Why a discovery cycle ended in `FAILED`.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Listing or stat failed in a way worth retrying.
    #[error("transient discovery failure: {0}")]
    Transient(ConnectorError),

    /// A non-retryable connector failure. Only the configuration, auth and
    /// permission categories are permanent; a missing location or a data
    /// error may clear up on a later cycle.
    #[error("source error: {0}")]
    Source(ConnectorError),

    #[error("sensor configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("cursor store error: {0}")]
    State(#[from] StateError),

    #[error("run request hand-off failed: {0}")]
    Sink(String),

    /// A blocking listing or state task panicked or was cancelled.
    #[error("discovery task failed: {0}")]
    Task(String),
}

impl DiscoveryError {
    /// Classify a connector failure by its retry metadata.
    #[must_use]
    pub fn from_connector(err: ConnectorError) -> Self {
        if err.retryable {
            Self::Transient(err)
        } else {
            Self::Source(err)
        }
    }

    /// Permanent failures surface immediately; everything else is retried
    /// with backoff.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Config(_) | Self::Template(_) => true,
            Self::Source(err) => matches!(
                err.category,
                ErrorCategory::Config | ErrorCategory::Auth | ErrorCategory::Permission
            ),
            Self::Transient(_) | Self::State(_) | Self::Sink(_) | Self::Task(_) => false,
        }
    }

    /// Delay before retry number `attempt` (1-based). Connector failures use
    /// [`compute_backoff`]; others double from `base`, capped at one minute
    /// or `base`, whichever is larger.
    #[must_use]
    pub fn retry_delay(&self, base: Duration, attempt: u32) -> Duration {
        if let Some(err) = self.as_connector_error() {
            return compute_backoff(err, attempt);
        }
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let cap = base.max(Duration::from_millis(BACKOFF_MAX_MS));
        base.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
    }

    #[must_use]
    pub fn as_connector_error(&self) -> Option<&ConnectorError> {
        match self {
            Self::Transient(e) | Self::Source(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer errors
// ---------------------------------------------------------------------------

/// Cause of a single item's failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ItemFailure {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("worker task failed: {0}")]
    Worker(String),
}

/// One item failed to transfer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("item `{item}` failed: {error}")]
pub struct TransferItemError {
    /// Identity of the failed item.
    pub item: String,
    pub error: ItemFailure,
}

impl TransferItemError {
    pub fn new(item: impl Into<String>, error: impl Into<ItemFailure>) -> Self {
        Self {
            item: item.into(),
            error: error.into(),
        }
    }
}

/// Failure of a whole asset execution.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Single-unit mode: the only item failed.
    #[error(transparent)]
    Item(#[from] TransferItemError),

    /// Listing the source failed before any item was moved.
    #[error("listing source failed: {0}")]
    Listing(ConnectorError),

    #[error("invalid transfer configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("run history error: {0}")]
    State(#[from] StateError),

    #[error("transfer task failed: {0}")]
    Task(String),

    #[error("transfer cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Retry delay for attempt `attempt` (1-based).
///
/// An explicit `retry_after_ms` wins; otherwise the delay doubles from a
/// base chosen by the backoff class, capped at one minute.
#[must_use]
pub fn compute_backoff(err: &ConnectorError, attempt: u32) -> Duration {
    if let Some(ms) = err.retry_after_ms {
        return Duration::from_millis(ms);
    }

    let base_ms: u64 = match err.backoff_class {
        BackoffClass::Fast => BACKOFF_FAST_BASE_MS,
        BackoffClass::Normal => BACKOFF_NORMAL_BASE_MS,
        BackoffClass::Slow => BACKOFF_SLOW_BASE_MS,
    };

    let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetflow_types::error::ErrorCategory;

    // -----------------------------------------------------------------------
    // DefinitionError
    // -----------------------------------------------------------------------

    #[test]
    fn definition_error_lists_every_problem() {
        let err = DefinitionError::new(vec![
            "Job 'j' selects unknown asset 'x'".into(),
            "Sensor 's' targets unknown job 'k'".into(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("unknown asset 'x'"));
        assert!(msg.contains("unknown job 'k'"));
    }

    #[test]
    fn definition_check_passes_when_empty() {
        assert!(DefinitionError::check(Vec::new()).is_ok());
        assert_eq!(
            DefinitionError::check(vec!["bad".into()]).unwrap_err(),
            DefinitionError::single("bad")
        );
    }

    // -----------------------------------------------------------------------
    // DiscoveryError
    // -----------------------------------------------------------------------

    #[test]
    fn retryable_connector_errors_are_transient() {
        let err = DiscoveryError::from_connector(ConnectorError::transient_network(
            "CONN_RESET",
            "connection reset by peer",
        ));
        assert!(matches!(err, DiscoveryError::Transient(_)));
        assert!(!err.is_permanent());
        assert_eq!(
            err.as_connector_error().unwrap().category,
            ErrorCategory::TransientNetwork
        );
    }

    #[test]
    fn auth_failures_are_permanent() {
        let err = DiscoveryError::from_connector(ConnectorError::auth("BAD_KEY", "denied"));
        assert!(err.is_permanent());
    }

    #[test]
    fn recoverable_failures_are_not_permanent() {
        let missing = DiscoveryError::from_connector(ConnectorError::not_found(
            "NO_SUCH_DIRECTORY",
            "/outbound does not exist",
        ));
        assert!(matches!(missing, DiscoveryError::Source(_)));
        assert!(!missing.is_permanent());
        let truncated = ConnectorError::data("BAD", "truncated");
        assert!(!DiscoveryError::from_connector(truncated).is_permanent());
        let internal = ConnectorError::internal("BUG", "oops");
        assert!(!DiscoveryError::from_connector(internal).is_permanent());
        assert!(!DiscoveryError::Sink("channel closed".into()).is_permanent());
        assert!(!DiscoveryError::Task("join failed".into()).is_permanent());
        assert!(
            !DiscoveryError::State(StateError::Corrupt("locked".into())).is_permanent()
        );
        let denied = ConnectorError::permission("RO", "denied");
        assert!(DiscoveryError::from_connector(denied).is_permanent());
    }

    #[test]
    fn retry_delay_without_connector_error_doubles_from_base() {
        let err = DiscoveryError::Sink("channel closed".into());
        let base = Duration::from_secs(5);
        assert_eq!(err.retry_delay(base, 1), Duration::from_secs(5));
        assert_eq!(err.retry_delay(base, 3), Duration::from_secs(20));
        assert_eq!(err.retry_delay(base, 10), Duration::from_secs(60));
        assert_eq!(err.retry_delay(Duration::from_secs(90), 4), Duration::from_secs(90));
    }

    #[test]
    fn config_and_template_failures_are_permanent() {
        assert!(DiscoveryError::Config("bad pattern".into()).is_permanent());
        let template = TemplateError::Type {
            field: "predicate".into(),
            message: "not a boolean".into(),
        };
        assert!(DiscoveryError::from(template).is_permanent());
    }

    // -----------------------------------------------------------------------
    // Transfer errors
    // -----------------------------------------------------------------------

    #[test]
    fn item_error_names_the_item() {
        let err = TransferItemError::new(
            "/in/a.csv",
            ConnectorError::data("TRUNCATED", "unexpected end of stream"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/in/a.csv"));
        assert!(msg.contains("TRUNCATED"));
        let run: TransferError = err.into();
        assert!(matches!(run, TransferError::Item(_)));
    }

    // -----------------------------------------------------------------------
    // compute_backoff
    // -----------------------------------------------------------------------

    #[test]
    fn backoff_fast() {
        let mut err = ConnectorError::transient_network("X", "y");
        err.backoff_class = BackoffClass::Fast;
        assert_eq!(compute_backoff(&err, 1), Duration::from_millis(100));
        assert_eq!(compute_backoff(&err, 2), Duration::from_millis(200));
        assert_eq!(compute_backoff(&err, 3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_normal() {
        let err = ConnectorError::transient_network("X", "y");
        assert_eq!(compute_backoff(&err, 1), Duration::from_millis(1000));
        assert_eq!(compute_backoff(&err, 2), Duration::from_millis(2000));
    }

    #[test]
    fn backoff_slow() {
        let err = ConnectorError::rate_limit("X", "y", None);
        assert_eq!(compute_backoff(&err, 1), Duration::from_millis(5000));
        assert_eq!(compute_backoff(&err, 2), Duration::from_millis(10000));
    }

    #[test]
    fn backoff_respects_retry_after() {
        let err = ConnectorError::rate_limit("X", "y", Some(7500));
        assert_eq!(compute_backoff(&err, 1), Duration::from_millis(7500));
        assert_eq!(compute_backoff(&err, 5), Duration::from_millis(7500));
    }

    #[test]
    fn backoff_capped_at_60s() {
        let err = ConnectorError::transient_network("X", "y");
        assert_eq!(compute_backoff(&err, 20), Duration::from_millis(60_000));
        assert_eq!(compute_backoff(&err, 200), Duration::from_millis(60_000));
    }
}
